#![forbid(unsafe_code)]

use std::fmt;

use thiserror::Error;

use crate::types::VertexId;

/// Structured errors emitted while compiling a traversal tree.
///
/// A failure aborts only the compilation that raised it; callers can use
/// [`CompileError::code`] to distinguish malformed trees from invalid step
/// parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The tree or the plan under construction violates a structural rule.
    #[error("malformed traversal at {node}: {reason}")]
    Structural {
        /// Step kind (or plan element) that was rejected.
        node: String,
        /// Human readable reason.
        reason: String,
    },
    /// A step referenced a label no reachable upstream step produced.
    #[error("unresolved label '{label}' referenced by {node}")]
    UnresolvedLabel {
        /// Label name.
        label: String,
        /// Step kind holding the reference.
        node: String,
    },
    /// Step parameters were rejected before any vertex was emitted.
    #[error("invalid parameters for {node}: {reason}")]
    Validation {
        /// Step kind carrying the parameters.
        node: String,
        /// Human readable reason.
        reason: String,
    },
    /// Property name is absent from the schema.
    #[error("unknown property '{prop}'")]
    UnknownProperty {
        /// Property name.
        prop: String,
    },
    /// Vertex or edge label is absent from the schema.
    #[error("unknown label '{label}'")]
    UnknownLabel {
        /// Label name.
        label: String,
    },
    /// Plan graph precondition failed: an id was referenced before being added.
    #[error("plan references vertex {vertex} before it was added")]
    DanglingVertex {
        /// Offending vertex id.
        vertex: VertexId,
    },
    /// The per-compilation vertex id counter wrapped.
    #[error("vertex id space exhausted")]
    VertexIdOverflow,
}

impl CompileError {
    /// Builds a [`CompileError::Structural`] for the given step.
    pub fn structural(node: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::Structural {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Builds a [`CompileError::Validation`] for the given step.
    pub fn validation(node: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::Validation {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Builds a [`CompileError::UnresolvedLabel`].
    pub fn unresolved(label: impl Into<String>, node: impl Into<String>) -> Self {
        CompileError::UnresolvedLabel {
            label: label.into(),
            node: node.into(),
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::Structural { .. } => "Structural",
            CompileError::UnresolvedLabel { .. } => "UnresolvedLabel",
            CompileError::Validation { .. } => "Validation",
            CompileError::UnknownProperty { .. } => "UnknownProperty",
            CompileError::UnknownLabel { .. } => "UnknownLabel",
            CompileError::DanglingVertex { .. } => "Structural",
            CompileError::VertexIdOverflow => "VertexIdOverflow",
        }
    }
}

/// Convenience wrapper that formats compile errors with their codes.
pub struct ErrorWithCode<'a>(pub &'a CompileError);

impl fmt::Display for ErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

/// Result alias for compilation.
pub type Result<T> = std::result::Result<T, CompileError>;
