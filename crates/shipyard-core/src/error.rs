//! Error taxonomy for the release train.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use shipyard_store::StorageError;
use shipyard_tools::ToolError;

/// One failed unit of work, as recorded by the scheduler or a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Label the task was submitted under (e.g. `build operator:1.2.0-arm64`).
    pub label: String,
    /// [`ShipyardError::kind`] of the underlying error.
    pub kind: String,
    /// Rendered error message.
    pub message: String,
}

impl TaskFailure {
    pub fn new(label: impl Into<String>, error: &ShipyardError) -> Self {
        Self {
            label: label.into(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.label, self.kind, self.message)
    }
}

/// Shipyard errors.
#[derive(Debug, thiserror::Error)]
pub enum ShipyardError {
    /// Missing or inconsistent input; raised before any work is submitted.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("version {pin} not found for image {image}")]
    NotFound { image: String, pin: String },

    /// The release manifest contradicts itself.
    #[error("invalid release manifest: {0}")]
    InvalidManifest(String),

    #[error("build of {tag} failed: {stderr}")]
    Build { tag: String, stderr: String },

    #[error("manifest {manifest} failed: {detail}")]
    Manifest { manifest: String, detail: String },

    #[error("transient network failure persisted: {0}")]
    TransientNetwork(String),

    #[error("verification failed for {0}")]
    Verification(String),

    #[error("sbom fetch failed: {0}")]
    SbomFetch(String),

    #[error("{failed} of {total} tasks failed ({})", kinds_list(.kinds))]
    AggregateBuildFailure {
        failed: usize,
        total: usize,
        kinds: BTreeSet<String>,
        failures: Vec<TaskFailure>,
    },

    #[error("tool error: {0}")]
    Tool(ToolError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    TaskJoin(String),
}

fn kinds_list(kinds: &BTreeSet<String>) -> String {
    kinds.iter().cloned().collect::<Vec<_>>().join(", ")
}

impl From<ToolError> for ShipyardError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::RetriesExhausted { .. } => ShipyardError::TransientNetwork(err.to_string()),
            other => ShipyardError::Tool(other),
        }
    }
}

impl From<reqwest::Error> for ShipyardError {
    fn from(err: reqwest::Error) -> Self {
        ShipyardError::Http(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ShipyardError {
    fn from(err: tokio::task::JoinError) -> Self {
        ShipyardError::TaskJoin(err.to_string())
    }
}

impl ShipyardError {
    /// Stable name of the error variant, used when aggregating failures.
    pub fn kind(&self) -> &'static str {
        match self {
            ShipyardError::Configuration(_) => "ConfigurationError",
            ShipyardError::NotFound { .. } => "NotFoundError",
            ShipyardError::InvalidManifest(_) => "InvalidManifestError",
            ShipyardError::Build { .. } => "BuildError",
            ShipyardError::Manifest { .. } => "ManifestError",
            ShipyardError::TransientNetwork(_) => "TransientNetworkError",
            ShipyardError::Verification(_) => "VerificationError",
            ShipyardError::SbomFetch(_) => "SbomFetchError",
            ShipyardError::AggregateBuildFailure { .. } => "AggregateBuildFailure",
            ShipyardError::Tool(_) => "ToolError",
            ShipyardError::Storage(_) => "StorageError",
            ShipyardError::Serialization(_) => "SerializationError",
            ShipyardError::Http(_) => "HttpError",
            ShipyardError::Io(_) => "IoError",
            ShipyardError::TaskJoin(_) => "TaskJoinError",
        }
    }

    /// Build an aggregate from recorded failures. `None` when nothing failed.
    pub fn aggregate(total: usize, failures: Vec<TaskFailure>) -> Option<Self> {
        if failures.is_empty() {
            return None;
        }
        let kinds = failures.iter().map(|f| f.kind.clone()).collect();
        Some(ShipyardError::AggregateBuildFailure {
            failed: failures.len(),
            total,
            kinds,
            failures,
        })
    }

    /// Failures carried by an aggregate, empty otherwise.
    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            ShipyardError::AggregateBuildFailure { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// Result type for Shipyard operations.
pub type Result<T> = std::result::Result<T, ShipyardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = ShipyardError::NotFound {
            image: "mongodb-agent".to_string(),
            pin: "9.9.9".to_string(),
        };
        assert!(err.to_string().contains("9.9.9"));
        assert_eq!(err.kind(), "NotFoundError");
    }

    #[test]
    fn test_exhausted_retries_become_transient() {
        let err: ShipyardError = ToolError::RetriesExhausted {
            command: "cosign sign".to_string(),
            attempts: 6,
            stderr: "503".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "TransientNetworkError");

        let err: ShipyardError = ToolError::Failed {
            command: "cosign sign".to_string(),
            exit_code: 1,
            stderr: "denied".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "ToolError");
    }

    #[test]
    fn test_aggregate_collects_distinct_kinds() {
        let build = ShipyardError::Build {
            tag: "a:1-amd64".to_string(),
            stderr: "oom".to_string(),
        };
        let manifest = ShipyardError::Manifest {
            manifest: "a:1".to_string(),
            detail: "push denied".to_string(),
        };
        let failures = vec![
            TaskFailure::new("build a:1-amd64", &build),
            TaskFailure::new("build a:1-arm64", &build),
            TaskFailure::new("manifest a:1", &manifest),
        ];

        let err = ShipyardError::aggregate(10, failures).expect("non-empty");
        match &err {
            ShipyardError::AggregateBuildFailure {
                failed,
                total,
                kinds,
                ..
            } => {
                assert_eq!(*failed, 3);
                assert_eq!(*total, 10);
                assert_eq!(kinds.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(err.failures().len(), 3);
        assert!(err.to_string().contains("3 of 10 tasks failed"));
        assert!(err.to_string().contains("BuildError, ManifestError"));
    }

    #[test]
    fn test_aggregate_empty_is_none() {
        assert!(ShipyardError::aggregate(4, Vec::new()).is_none());
    }
}
