//! S3 backend driven through the `aws` CLI.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use shipyard_tools::{CommandRunner, Invocation, ToolError};

use crate::error::StorageError;
use crate::object_store::{validate_key, ObjectStore};
use crate::StorageResult;

/// S3 configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    /// Bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
}

impl Default for S3Config {
    fn default() -> Self {
        S3Config {
            bucket: std::env::var("SBOM_S3_BUCKET")
                .unwrap_or_else(|_| "kubernetes-operators-sboms".to_string()),
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
        }
    }
}

impl S3Config {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn new(bucket: &str, region: &str) -> Self {
        S3Config {
            bucket: bucket.to_string(),
            region: region.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListObjectsPage {
    #[serde(rename = "Contents", default)]
    contents: Vec<ListedObject>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    #[serde(rename = "Key")]
    key: String,
}

/// [`ObjectStore`] over `aws s3api` / `aws s3 cp`.
pub struct S3CliStore {
    config: S3Config,
    runner: Arc<dyn CommandRunner>,
}

impl S3CliStore {
    pub fn new(config: S3Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }

    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.config.bucket, key)
    }

    fn aws(&self) -> Invocation {
        Invocation::new("aws").args(["--region", self.config.region.as_str()])
    }
}

fn is_missing_object(stderr: &str) -> bool {
    stderr.contains("404") || stderr.contains("Not Found") || stderr.contains("NoSuchKey")
}

#[async_trait]
impl ObjectStore for S3CliStore {
    async fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(data)?;
        tmp.flush()?;

        let source = tmp.path().display().to_string();
        let inv = self.aws().args(["s3", "cp", source.as_str(), self.uri(key).as_str()]);
        self.runner.run_checked(&inv).await?;
        debug!(key, bytes = data.len(), "uploaded object");
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        validate_key(key)?;
        let tmp = NamedTempFile::new()?;
        let target = tmp.path().display().to_string();
        let inv = self.aws().args(["s3", "cp", self.uri(key).as_str(), target.as_str()]);

        match self.runner.run_checked(&inv).await {
            Ok(_) => Ok(tokio::fs::read(tmp.path()).await?),
            Err(ToolError::Failed { stderr, .. }) if is_missing_object(&stderr) => {
                Err(StorageError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_first(&self, prefix: &str) -> StorageResult<Option<String>> {
        let inv = self.aws().args([
            "s3api",
            "list-objects-v2",
            "--bucket",
            self.config.bucket.as_str(),
            "--prefix",
            prefix,
            "--max-items",
            "1",
            "--output",
            "json",
        ]);
        let out = self.runner.run_checked(&inv).await?;
        let body = out.stdout.trim();
        if body.is_empty() || body == "null" {
            return Ok(None);
        }
        let page: ListObjectsPage = serde_json::from_str(body)?;
        Ok(page.contents.into_iter().next().map(|obj| obj.key))
    }

    fn describe(&self, key: &str) -> String {
        self.uri(key)
    }
}
