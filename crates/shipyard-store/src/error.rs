//! Error types for shipyard-store

use shipyard_tools::ToolError;
use thiserror::Error;

/// Errors that can occur in an object store backend
#[derive(Error, Debug)]
pub enum StorageError {
    /// No object stored under the key
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// Key is empty, absolute, or escapes the store root
    #[error("invalid object key: {key}")]
    InvalidKey { key: String },

    /// Backend answered but the response was unusable
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Backend CLI invocation failed
    #[error("storage tool error: {0}")]
    Tool(#[from] ToolError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
