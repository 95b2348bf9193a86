//! Shipyard Tools
//!
//! Thin async layer over the external tools the release train drives
//! (docker, cosign, aws, silkbomb).
//!
//! # Features
//!
//! - **Command runner**: `tokio::process` execution with captured output and optional timeout
//! - **Retry**: bounded exponential backoff gated by stderr classification
//! - **Fakes**: a scripted runner for tests that never spawns processes

pub mod error;
pub mod fakes;
pub mod retry;
pub mod runner;

pub use error::ToolError;
pub use retry::{is_retryable, retry_async, run_with_retries, RetryPolicy, RETRYABLE_MARKERS};
pub use runner::{CommandOutput, CommandRunner, Invocation, TokioCommandRunner};

/// Result type for tool operations
pub type Result<T> = std::result::Result<T, ToolError>;
