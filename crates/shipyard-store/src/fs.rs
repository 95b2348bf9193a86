use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::object_store::{validate_key, ObjectStore};
use crate::StorageResult;

/// Filesystem-backed object store for local runs.
///
/// Layout: `<root>/<key>`, one file per object.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Create a new `FsObjectStore` rooted at `root`. Creates `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Run blocking filesystem work off the async worker threads.
    async fn blocking<T, F>(&self, work: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&FsObjectStore) -> StorageResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| StorageError::Backend(format!("filesystem task failed: {e}")))?
    }

    fn write_object(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.object_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey {
                key: key.to_string(),
            })?;
        fs::create_dir_all(parent)?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.object_path(key)?;
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(e)
            }
        })
    }

    fn first_with_prefix(&self, prefix: &str) -> StorageResult<Option<String>> {
        // Only the directory part of the prefix needs walking.
        let dir = match prefix.rfind('/') {
            Some(idx) => {
                validate_key(&prefix[..idx + 1])?;
                self.root.join(&prefix[..idx])
            }
            None => self.root.clone(),
        };
        let mut keys = Vec::new();
        self.walk(&dir, &mut keys)?;
        Ok(keys.into_iter().find(|key| key.starts_with(prefix)))
    }

    /// All object keys under `dir`, sorted.
    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> StorageResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut paths: Vec<PathBuf> = entries
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.path())
            .collect();
        paths.sort();
        for path in paths {
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let key = key.to_string();
        let data = data.to_vec();
        self.blocking(move |store| store.write_object(&key, &data)).await
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let key = key.to_string();
        self.blocking(move |store| store.read_object(&key)).await
    }

    async fn find_first(&self, prefix: &str) -> StorageResult<Option<String>> {
        let prefix = prefix.to_string();
        self.blocking(move |store| store.first_with_prefix(&prefix)).await
    }

    fn describe(&self, key: &str) -> String {
        self.root.join(key).display().to_string()
    }
}
