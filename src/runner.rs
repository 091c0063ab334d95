//! High-level runner API for a shard worker.
//!
//! This module wires a blob store, the process-backed collaborators and the
//! progress display around a [`Worker`]. It is the entry point used by the
//! `shard-worker` binary.

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::collaborators::{GitFetcher, PlaywrightExecutor, PlaywrightMerger};
use crate::coordination::identity::repo_name_from_url;
use crate::coordination::{Worker, WorkerConfigBuilder, WorkerOutcome};
use crate::store::{BlobStore, LocalBlobStore, MemoryBlobStore, S3BlobStore, StoreUri};
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Arguments for running one worker of a sharded run
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub worker_index: u32,
    pub worker_count: u32,

    // Store configuration
    /// Bucket name, `s3://bucket/prefix`, `file:///path` or a local directory
    pub store: String,
    /// Custom S3 endpoint (MinIO, LocalStack)
    pub endpoint_url: Option<String>,

    // Source configuration
    pub repo_url: String,
    pub git_ref: String,

    // Identity
    /// Defaults to the repository name
    pub base_id: Option<String>,
    pub execution_token: Option<String>,

    // Options
    pub scratch_dir: Option<PathBuf>,
    pub use_workspace_cache: bool,
    pub quiet: bool,
}

/// Resolve the store argument; a bare name without `/` is an S3 bucket
pub fn resolve_store_uri(store: &str) -> Result<StoreUri> {
    let store = store.trim();
    let is_bare_bucket = !store.is_empty()
        && !store.contains('/')
        && !store.contains('\\')
        && !store.contains(':')
        && !store.starts_with('.');
    if is_bare_bucket {
        return Ok(StoreUri::S3 {
            bucket: store.to_string(),
            prefix: String::new(),
        });
    }
    StoreUri::parse(store)
}

async fn build_store(uri: StoreUri, endpoint_url: Option<&str>) -> Result<Arc<dyn BlobStore>> {
    Ok(match uri {
        StoreUri::Local(path) => Arc::new(LocalBlobStore::new(path)),
        StoreUri::Memory => Arc::new(MemoryBlobStore::new()),
        StoreUri::S3 { bucket, prefix } => {
            let mut loader = aws_config::defaults(BehaviorVersion::latest());
            if let Some(endpoint) = endpoint_url {
                loader = loader.endpoint_url(endpoint);
            }
            let aws_config = loader.load().await;

            let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
            if endpoint_url.is_some() {
                // S3-compatible servers rarely support virtual-hosted buckets
                s3_config = s3_config.force_path_style(true);
            }
            let client = aws_sdk_s3::Client::from_conf(s3_config.build());
            Arc::new(S3BlobStore::new(Arc::new(client), bucket, prefix))
        }
    })
}

fn setup_progress_tracking(
    quiet: bool,
    mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
) -> Result<tokio::task::JoinHandle<ProgressStats>> {
    if quiet {
        return Ok(tokio::spawn(async move {
            let mut stats = ProgressStats::new();
            while let Some(event) = telemetry_rx.recv().await {
                stats.update(&event);
            }
            stats
        }));
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] Shards: [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("=>-"),
    );

    Ok(tokio::spawn(async move {
        let mut stats = ProgressStats::new();

        while let Some(event) = telemetry_rx.recv().await {
            stats.update(&event);

            bar.set_length(stats.expected_shards as u64);
            bar.set_position(stats.observed_shards as u64);
            if let Some(run_id) = &stats.run_id {
                bar.set_message(run_id.clone());
            }
        }

        if stats.merged {
            bar.finish_with_message(format!(
                "merged, cleanup removed {} object(s)",
                stats.cleanup_deleted
            ));
        } else {
            bar.finish_and_clear();
        }
        stats
    }))
}

/// Run one worker with the process-backed collaborators
///
/// Returns once this worker's shard is published and, for worker 0, the
/// merged report is in the store.
pub async fn run_worker(args: WorkerArgs) -> Result<WorkerOutcome> {
    let store_uri = resolve_store_uri(&args.store)?;
    let store = build_store(store_uri, args.endpoint_url.as_deref()).await?;
    info!("Using blob store {}", store.describe());

    let scratch_root = args
        .scratch_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("shard-worker"));
    let project = repo_name_from_url(&args.repo_url);
    let base_id = args.base_id.clone().unwrap_or_else(|| project.clone());

    let mut builder = WorkerConfigBuilder::default();
    builder
        .worker_index(args.worker_index)
        .worker_count(args.worker_count)
        .base_id(base_id)
        .repo_url(&args.repo_url)
        .git_ref(&args.git_ref)
        .project(project)
        .scratch_root(scratch_root)
        .use_workspace_cache(args.use_workspace_cache);
    if let Some(token) = &args.execution_token {
        builder.execution_token(token);
    }
    let config = builder.build().context("Invalid worker configuration")?;

    let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
    let progress = setup_progress_tracking(args.quiet, telemetry_rx)?;

    let worker = Worker::new(
        config,
        store,
        Arc::new(GitFetcher::new()),
        Arc::new(PlaywrightExecutor::default()),
        Arc::new(PlaywrightMerger),
    )
    .with_telemetry(telemetry_tx);

    let result = worker.run().await;

    // Dropping the worker closes the channel and ends the progress task
    drop(worker);
    let _ = progress.await;

    Ok(result?)
}
