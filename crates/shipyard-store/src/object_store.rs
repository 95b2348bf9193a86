//! Object store trait.
//!
//! Keys are `/`-separated relative paths. The only state the release train
//! keeps about an artifact is whether its computed key exists, so
//! [`ObjectStore::find_first`] is the query everything else is built on.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::StorageResult;

/// Durable key/value blob storage.
///
/// There is no conditional put: callers that gate a write on `exists` accept
/// that two concurrent writers may both see the key absent. Keys that embed
/// a content digest make such duplicate writes harmless.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, overwriting any existing object.
    async fn put(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Fetch the object under `key`. Returns `StorageError::NotFound` if absent.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// First key (in backend order) starting with `prefix`, if any.
    async fn find_first(&self, prefix: &str) -> StorageResult<Option<String>>;

    /// Whether at least one key starts with `prefix`.
    async fn exists(&self, prefix: &str) -> StorageResult<bool> {
        Ok(self.find_first(prefix).await?.is_some())
    }

    /// Human-readable location of `key`, for logs.
    fn describe(&self, key: &str) -> String {
        key.to_string()
    }
}

/// Reject keys that are empty, absolute, or contain `..` segments.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|segment| segment == "..");
    if bad {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
        })
    } else {
        Ok(())
    }
}
