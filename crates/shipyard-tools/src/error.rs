//! Error types for shipyard-tools

use thiserror::Error;

use crate::retry::is_retryable;

/// Errors raised while invoking an external tool.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The executable could not be started.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The invocation exceeded its configured timeout.
    #[error("`{command}` timed out after {timeout_secs} seconds")]
    Timeout { command: String, timeout_secs: u64 },

    /// The tool ran and exited non-zero.
    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Every retry attempt hit a retryable failure.
    #[error("`{command}` still failing after {attempts} attempts: {stderr}")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        stderr: String,
    },

    /// The invocation was malformed before it reached the OS.
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// Captured stderr, when the tool got far enough to produce any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ToolError::Failed { stderr, .. } | ToolError::RetriesExhausted { stderr, .. } => {
                Some(stderr)
            }
            _ => None,
        }
    }

    /// Whether a retry loop should try this invocation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Failed { stderr, .. } => is_retryable(stderr),
            ToolError::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_with_rate_limit_is_retryable() {
        let err = ToolError::Failed {
            command: "cosign sign".into(),
            exit_code: 1,
            stderr: "error: 429 Too Many Requests".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.stderr(), Some("error: 429 Too Many Requests"));
    }

    #[test]
    fn auth_failure_is_not_retryable() {
        let err = ToolError::Failed {
            command: "cosign sign".into(),
            exit_code: 1,
            stderr: "UNAUTHORIZED: authentication required".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn exhausted_is_terminal() {
        let err = ToolError::RetriesExhausted {
            command: "cosign verify".into(),
            attempts: 10,
            stderr: "503".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("10 attempts"));
    }
}
