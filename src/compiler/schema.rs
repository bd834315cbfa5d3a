//! Schema lookup bridging the names used in traversal steps to the identifiers
//! and scalar kinds the backend operators expect.
//!
//! Schema storage lives outside this crate; the compiler only needs a
//! read-only view, so everything goes through [`GraphSchema`].

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::compiler::errors::{CompileError, Result};
use crate::compiler::value::VariantType;

/// Resolved property definition.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Numeric property identifier.
    pub id: u32,
    /// Scalar kind stored under the property.
    #[serde(rename = "type")]
    pub ty: VariantType,
}

/// Provides name-to-identifier resolution for tree nodes.
pub trait GraphSchema: Send + Sync {
    /// Resolves a vertex label name to its numeric identifier.
    fn resolve_vertex_label(&self, name: &str) -> Result<u32>;
    /// Resolves an edge label name to its numeric identifier.
    fn resolve_edge_label(&self, name: &str) -> Result<u32>;
    /// Resolves a property name to its definition.
    fn resolve_property(&self, name: &str) -> Result<PropertyDef>;
}

/// Simple in-memory schema used for tests, the CLI, and prototyping.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InMemorySchema {
    #[serde(default)]
    vertex_labels: FxHashMap<String, u32>,
    #[serde(default)]
    edge_labels: FxHashMap<String, u32>,
    #[serde(default)]
    properties: FxHashMap<String, PropertyDef>,
}

impl InMemorySchema {
    /// Creates a new empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a vertex label.
    pub fn with_vertex_label(mut self, name: impl Into<String>, id: u32) -> Self {
        self.vertex_labels.insert(name.into(), id);
        self
    }

    /// Registers an edge label.
    pub fn with_edge_label(mut self, name: impl Into<String>, id: u32) -> Self {
        self.edge_labels.insert(name.into(), id);
        self
    }

    /// Registers a property with its scalar kind.
    pub fn with_property(mut self, name: impl Into<String>, id: u32, ty: VariantType) -> Self {
        self.properties.insert(name.into(), PropertyDef { id, ty });
        self
    }
}

impl GraphSchema for InMemorySchema {
    fn resolve_vertex_label(&self, name: &str) -> Result<u32> {
        self.vertex_labels
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::UnknownLabel {
                label: name.to_owned(),
            })
    }

    fn resolve_edge_label(&self, name: &str) -> Result<u32> {
        self.edge_labels
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::UnknownLabel {
                label: name.to_owned(),
            })
    }

    fn resolve_property(&self, name: &str) -> Result<PropertyDef> {
        self.properties
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::UnknownProperty {
                prop: name.to_owned(),
            })
    }
}
