//! Workspace cache: fetch and install once, share the result as an archive
//!
//! Worker 0 prepares the checkout, packs it into `{run}/workspace/workspace.tgz`
//! and announces READY through a once-barrier. Every other worker downloads
//! and extracts that archive into the same local path, so absolute paths in
//! generated reports line up across shards.

use anyhow::{Context, anyhow};
use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use super::identity::sanitize_id;
use super::keys::RunKeys;
use super::manifest::ReadyMarker;
use super::once_barrier::OnceBarrier;
use crate::config::WORKSPACE_EXCLUDES;
use crate::error::{CoordinationError, CoordinationResult};
use crate::store::{BlobStore, RetryPolicy, retry};

pub struct WorkspaceCache {
    store: Arc<dyn BlobStore>,
    scratch_root: PathBuf,
    name: String,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl WorkspaceCache {
    pub fn new(
        store: Arc<dyn BlobStore>,
        scratch_root: impl Into<PathBuf>,
        name: impl Into<String>,
        poll_interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            scratch_root: scratch_root.into(),
            name: name.into(),
            poll_interval,
            retry,
        }
    }

    /// Directory every worker extracts into; identical across workers of a run
    pub fn extract_root(&self, run_id: &str) -> PathBuf {
        self.scratch_root
            .join(format!("workspace-{}", sanitize_id(run_id)))
            .join("extracted")
    }

    pub fn workspace_path(&self, run_id: &str) -> PathBuf {
        self.extract_root(run_id).join(&self.name)
    }

    /// Return a ready workspace, running `setup` only on worker 0
    pub async fn ensure<F, Fut>(
        &self,
        setup: F,
        run_id: &str,
        worker_index: u32,
        timeout: Duration,
    ) -> CoordinationResult<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let keys = RunKeys::new(run_id);
        let barrier = OnceBarrier::new(
            Arc::clone(&self.store),
            keys.workspace_ready(),
            self.poll_interval,
            self.retry,
        );

        if worker_index == 0 {
            self.prepare(setup, &keys, &barrier).await
        } else {
            self.restore(&keys, &barrier, timeout).await
        }
    }

    async fn prepare<F, Fut>(
        &self,
        setup: F,
        keys: &RunKeys,
        barrier: &OnceBarrier,
    ) -> CoordinationResult<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let workspace = self.workspace_path(keys.run_id());
        let work_dir = self.extract_root(keys.run_id()).with_file_name("work");
        fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| CoordinationError::infra("create workspace scratch", e.into()))?;

        info!("Preparing workspace at {}", workspace.display());
        setup(workspace.clone())
            .await
            .map_err(|cause| CoordinationError::Collaborator {
                name: "workspace setup",
                cause,
            })?;

        let archive = work_dir.join("workspace.tgz");
        let archive_bytes = pack(&workspace, &self.name, &archive)
            .await
            .map_err(|e| CoordinationError::infra("pack workspace", e))?;
        info!("Packed workspace ({} bytes)", archive_bytes);

        let archive_key = keys.workspace_archive();
        retry(&format!("upload {}", archive_key), self.retry, || {
            self.store.put_file(&archive_key, &archive)
        })
        .await
        .map_err(|cause| CoordinationError::Upload {
            key: archive_key.clone(),
            cause,
        })?;

        barrier
            .announce(&ReadyMarker {
                archive_key,
                archive_bytes,
                ready_at: Utc::now().to_rfc3339(),
            })
            .await?;

        info!("Workspace READY");
        Ok(workspace)
    }

    async fn restore(
        &self,
        keys: &RunKeys,
        barrier: &OnceBarrier,
        timeout: Duration,
    ) -> CoordinationResult<PathBuf> {
        info!("Waiting for workspace READY marker {}", barrier.key());
        let ready: ReadyMarker = barrier.await_announcement(timeout).await?;

        let extract_root = self.extract_root(keys.run_id());
        let archive = extract_root.with_file_name("workspace.tgz");
        fs::create_dir_all(&extract_root)
            .await
            .map_err(|e| CoordinationError::infra("create extract root", e.into()))?;

        retry(&format!("download {}", ready.archive_key), self.retry, || {
            self.store.get_to_file(&ready.archive_key, &archive)
        })
        .await
        .map_err(|e| CoordinationError::infra(format!("download {}", ready.archive_key), e))?;

        unpack(&archive, &extract_root)
            .await
            .map_err(|e| CoordinationError::infra("extract workspace", e))?;

        let workspace = self.workspace_path(keys.run_id());
        if fs::try_exists(&workspace).await.unwrap_or(false) {
            info!("Workspace extracted to {}", workspace.display());
            return Ok(workspace);
        }

        let fallback = first_directory(&extract_root).await.ok_or_else(|| {
            CoordinationError::infra(
                "extract workspace",
                anyhow!("archive {} had no top-level directory", ready.archive_key),
            )
        })?;
        warn!(
            "{} not found after extraction, using {}",
            workspace.display(),
            fallback.display()
        );
        Ok(fallback)
    }
}

/// Pack `dir` as `{name}/...` into a gzip'd tarball, skipping excluded directories
async fn pack(dir: &Path, name: &str, archive: &Path) -> anyhow::Result<u64> {
    let dir = dir.to_path_buf();
    let name = name.to_string();
    let archive = archive.to_path_buf();

    tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
        let file = std::fs::File::create(&archive)
            .with_context(|| format!("Failed to create {}", archive.display()))?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.follow_symlinks(false);

        append_tree(&mut builder, &dir, Path::new(&name))?;

        builder.into_inner()?.finish()?;
        Ok(std::fs::metadata(&archive)?.len())
    })
    .await?
}

fn append_tree<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    archive_path: &Path,
) -> anyhow::Result<()> {
    builder.append_dir(archive_path, dir)?;

    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let file_name = entry.file_name();
        let path = entry.path();
        let target = archive_path.join(&file_name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if WORKSPACE_EXCLUDES.iter().any(|ex| file_name == *ex) {
                continue;
            }
            append_tree(builder, &path, &target)?;
        } else {
            builder
                .append_path_with_name(&path, &target)
                .with_context(|| format!("Failed to archive {}", path.display()))?;
        }
    }
    Ok(())
}

async fn unpack(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let file = std::fs::File::open(&archive)
            .with_context(|| format!("Failed to open {}", archive.display()))?;
        tar::Archive::new(GzDecoder::new(file))
            .unpack(&dest)
            .with_context(|| format!("Failed to extract into {}", dest.display()))
    })
    .await?
}

async fn first_directory(root: &Path) -> Option<PathBuf> {
    let mut entries = fs::read_dir(root).await.ok()?;
    let mut dirs = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    dirs.into_iter().next()
}
