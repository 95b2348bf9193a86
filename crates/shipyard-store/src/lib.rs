//! Shipyard Store
//!
//! Durable blob storage for release artifacts (SBOMs). Existence of a
//! computed key is the only persisted state; there is no index.
//!
//! Backends: S3 through the `aws` CLI, a local filesystem tree, and an
//! in-memory fake for tests.

pub mod error;
pub mod fakes;
pub mod fs;
pub mod object_store;
pub mod s3;

pub use error::StorageError;
pub use fs::FsObjectStore;
pub use object_store::{validate_key, ObjectStore};
pub use s3::{S3CliStore, S3Config};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;
