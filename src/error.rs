//! Crate-level error type.

use thiserror::Error;

use crate::compiler::errors::CompileError;
use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use crate::session::SessionError;

/// Result alias for the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Any failure surfaced by the frontend.
#[derive(Debug, Error)]
pub enum Error {
    /// Traversal compilation failed.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// Dispatch rejected the request.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Write-session token could not be parsed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Input could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
