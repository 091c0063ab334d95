//! Blob store abstraction shared by every worker of a run
//!
//! The coordination protocol only relies on per-object atomic writes, reads,
//! existence checks, prefix listing and deletes, so backends stay small.

pub mod local;
pub mod memory;
pub mod retry;
pub mod s3;
pub mod uri;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;
pub use retry::{RetryPolicy, retry};
pub use s3::S3BlobStore;
pub use uri::StoreUri;

/// Trait for blob store operations
///
/// Implementations must never expose a partially written object: a reader
/// either sees no object or the complete bytes of one `put`. Listing may lag
/// behind writes but must not forget a key that was already listed.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write an object, replacing any previous value
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Read an object, or `None` if it does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// List every key starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Human-readable location used in log lines
    fn describe(&self) -> String;

    /// Time-limited read link to an object, `None` when the backend cannot sign
    async fn presign(&self, _key: &str, _ttl: Duration) -> Result<Option<String>> {
        Ok(None)
    }

    /// Upload a local file as one object
    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.put(key, bytes).await
    }

    /// Download an object into a local file, creating parent directories
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<()> {
        let bytes = self
            .get(key)
            .await?
            .with_context(|| format!("Object {} does not exist", key))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        fs::write(path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Join key segments with `/`, ignoring empty segments and stray slashes
pub fn join_key(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
