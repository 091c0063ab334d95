//! Artifact publishing: one worker's write of its partial result
//!
//! Payload objects go first, the receipt goes last. The completion barrier
//! only counts receipts, so a directory that is still uploading is never
//! mistaken for a finished shard.

use anyhow::Context;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

use super::keys::{RECEIPT_NAME, RunKeys};
use super::manifest::PublishReceipt;
use crate::error::{CoordinationError, CoordinationResult};
use crate::store::{BlobStore, RetryPolicy, retry};

/// A local file and the `/`-separated key it is uploaded under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEntry {
    pub path: PathBuf,
    pub relative_key: String,
}

/// Collect every file below `root` with its relative key, sorted by key
///
/// A single file yields one entry named after the file itself.
pub async fn collect_upload_entries(root: &Path) -> anyhow::Result<Vec<UploadEntry>> {
    let metadata = fs::metadata(root)
        .await
        .with_context(|| format!("Artifact {} does not exist", root.display()))?;

    if metadata.is_file() {
        let name = root
            .file_name()
            .with_context(|| format!("Artifact {} has no file name", root.display()))?
            .to_string_lossy()
            .into_owned();
        return Ok(vec![UploadEntry {
            path: root.to_path_buf(),
            relative_key: name,
        }]);
    }

    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut read_dir = fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read {}", dir.display()))?;

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .with_context(|| format!("Failed to read entry in {}", dir.display()))?
        {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }

            let relative = path
                .strip_prefix(root)
                .context("Walked outside of artifact root")?;
            let relative_key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");

            entries.push(UploadEntry { path, relative_key });
        }
    }

    entries.sort_by(|a, b| a.relative_key.cmp(&b.relative_key));
    Ok(entries)
}

pub struct ArtifactPublisher {
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn BlobStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Upload a worker's partial artifact and its receipt
    ///
    /// Re-publishing with the same arguments rewrites the same keys with the
    /// same bytes and keeps an equivalent existing receipt, leaving the store
    /// in the same end state.
    pub async fn publish(
        &self,
        local_artifact: &Path,
        run_id: &str,
        worker_index: u32,
        total_workers: u32,
        exit_code: i32,
    ) -> CoordinationResult<PublishReceipt> {
        let keys = RunKeys::new(run_id);
        let entries = collect_upload_entries(local_artifact).await.map_err(|e| {
            CoordinationError::config(format!("cannot publish {}: {:#}", local_artifact.display(), e))
        })?;

        if entries.iter().any(|e| e.relative_key == RECEIPT_NAME) {
            return Err(CoordinationError::config(format!(
                "artifact {} contains reserved file name {}",
                local_artifact.display(),
                RECEIPT_NAME
            )));
        }

        info!(
            "Publishing {} file(s) from {} to {}",
            entries.len(),
            local_artifact.display(),
            keys.shard_prefix(worker_index)
        );

        for entry in &entries {
            let key = keys.shard_object(worker_index, &entry.relative_key);
            retry(&format!("upload {}", key), self.retry, || {
                self.store.put_file(&key, &entry.path)
            })
            .await
            .map_err(|cause| CoordinationError::Upload {
                key: key.clone(),
                cause,
            })?;
            debug!("Uploaded {}", key);
        }

        let mut receipt = PublishReceipt {
            worker_index,
            total_workers,
            exit_code,
            files: entries.into_iter().map(|e| e.relative_key).collect(),
            published_at: Utc::now().to_rfc3339(),
        };

        let receipt_key = keys.receipt(worker_index);
        if let Some(existing) = self.existing_receipt(&receipt_key).await
            && existing.worker_index == receipt.worker_index
            && existing.total_workers == receipt.total_workers
            && existing.exit_code == receipt.exit_code
            && existing.files == receipt.files
        {
            receipt.published_at = existing.published_at;
            info!("Receipt {} already up to date", receipt_key);
            return Ok(receipt);
        }

        let bytes = serde_json::to_vec_pretty(&receipt).map_err(|e| CoordinationError::Upload {
            key: receipt_key.clone(),
            cause: e.into(),
        })?;

        retry(&format!("upload {}", receipt_key), self.retry, || {
            self.store.put(&receipt_key, bytes.clone())
        })
        .await
        .map_err(|cause| CoordinationError::Upload {
            key: receipt_key.clone(),
            cause,
        })?;

        info!(
            "Shard {} published (exit code {}, {} file(s))",
            worker_index,
            exit_code,
            receipt.files.len()
        );
        Ok(receipt)
    }

    async fn existing_receipt(&self, key: &str) -> Option<PublishReceipt> {
        let bytes = self.store.get(key).await.ok().flatten()?;
        serde_json::from_slice(&bytes).ok()
    }
}
