//! One worker process: fetch, run a shard, publish it, and merge on worker 0

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::identity::{RunIdentity, RunIdentityCoordinator, repo_name_from_url, sanitize_id};
use super::keys::run_id_marker;
use super::manifest::PublishReceipt;
use super::merge::{MergeCoordinator, MergeOutcome};
use super::once_barrier::OnceBarrier;
use super::publisher::ArtifactPublisher;
use super::shard::{ShardSpec, WorkerTask, plan};
use super::workspace::WorkspaceCache;
use super::WorkerConfig;
use crate::collaborators::{ReportMerger, SourceFetcher, TestExecutor};
use crate::error::{CoordinationError, CoordinationResult};
use crate::store::BlobStore;
use crate::telemetry::TelemetryEvent;

/// What one worker did during its run
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub identity: RunIdentity,
    pub shard: ShardSpec,
    /// Exit code reported by the test executor for this shard
    pub exit_code: i32,
    pub receipt: PublishReceipt,
    /// Present on worker 0 only
    pub merge: Option<MergeOutcome>,
}

/// One process of a sharded run
pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn BlobStore>,
    fetcher: Arc<dyn SourceFetcher>,
    executor: Arc<dyn TestExecutor>,
    merger: Arc<dyn ReportMerger>,
    telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn BlobStore>,
        fetcher: Arc<dyn SourceFetcher>,
        executor: Arc<dyn TestExecutor>,
        merger: Arc<dyn ReportMerger>,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
            executor,
            merger,
            telemetry_tx: None,
        }
    }

    pub fn with_telemetry(mut self, tx: mpsc::UnboundedSender<TelemetryEvent>) -> Self {
        self.telemetry_tx = Some(tx);
        self
    }

    /// Run this worker's shard end to end; worker 0 also merges
    ///
    /// A failing test suite is not an error: the shard is still published and
    /// its exit code is reported in the outcome.
    pub async fn run(&self) -> CoordinationResult<WorkerOutcome> {
        let started_at = Utc::now();
        let config = &self.config;

        let task = WorkerTask::new(config.worker_index, config.worker_count)?;
        if config.repo_url.trim().is_empty() {
            return Err(CoordinationError::config("repository url is empty"));
        }
        let shard = plan(task);
        let leader_tag = if task.is_leader() { " (leader)" } else { "" };
        info!("Worker {} of {}{}", task.index, task.total_count, leader_tag);

        let identity = RunIdentityCoordinator::new(
            Arc::clone(&self.store),
            config.execution_token.clone(),
            config.marker_poll_interval,
            config.retry,
        )
        .with_freshness(started_at, config.identity_marker_tolerance)
        .generate(
            &config.base_id,
            task.index,
            task.total_count,
            config.identity_timeout,
        )
        .await?;
        self.send(TelemetryEvent::IdentityResolved {
            run_id: identity.run_id.clone(),
        });
        info!("Run id: {}", identity.run_id);

        match self.run_shard(task, shard, identity.clone(), started_at).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if task.is_leader() && identity.execution_token.is_none() {
                    self.clear_identity_marker(&identity).await;
                }
                Err(e)
            }
        }
    }

    /// Everything after the run identity is agreed
    async fn run_shard(
        &self,
        task: WorkerTask,
        shard: ShardSpec,
        identity: RunIdentity,
        started_at: DateTime<Utc>,
    ) -> CoordinationResult<WorkerOutcome> {
        let config = &self.config;
        let source_dir = self.prepare_sources(&identity, task).await?;

        let output_dir = config
            .scratch_root
            .join(format!("results-{}", sanitize_id(&identity.run_id)))
            .join(format!("shard-{}", task.index));
        let result = self
            .executor
            .execute(shard, &source_dir, &output_dir)
            .await
            .map_err(|cause| CoordinationError::Collaborator {
                name: "test executor",
                cause,
            })?;
        info!(
            "Shard {} finished with exit code {}",
            shard.shard_arg(),
            result.exit_code
        );

        let receipt = ArtifactPublisher::new(Arc::clone(&self.store), config.retry)
            .publish(
                &result.artifact_path,
                &identity.run_id,
                task.index,
                task.total_count,
                result.exit_code,
            )
            .await?;
        self.send(TelemetryEvent::ShardPublished {
            worker_index: task.index,
            exit_code: result.exit_code,
        });

        let merge = if task.is_leader() {
            let mut coordinator = MergeCoordinator::new(
                Arc::clone(&self.store),
                Arc::clone(&self.merger),
                &config.scratch_root,
                config.merge_settings(),
            )
            .with_labels(config.project.clone(), Some(config.git_ref.clone()));
            if let Some(tx) = &self.telemetry_tx {
                coordinator = coordinator.with_telemetry(tx.clone());
            }
            Some(
                coordinator
                    .merge(&identity, task.total_count, started_at)
                    .await?,
            )
        } else {
            None
        };

        Ok(WorkerOutcome {
            identity,
            shard,
            exit_code: result.exit_code,
            receipt,
            merge,
        })
    }

    /// Checkout to run against: shared through the workspace cache or fetched directly
    async fn prepare_sources(
        &self,
        identity: &RunIdentity,
        task: WorkerTask,
    ) -> CoordinationResult<PathBuf> {
        let config = &self.config;
        let name = repo_name_from_url(&config.repo_url);
        let fetcher = Arc::clone(&self.fetcher);

        if config.use_workspace_cache {
            let cache = WorkspaceCache::new(
                Arc::clone(&self.store),
                &config.scratch_root,
                name,
                config.marker_poll_interval,
                config.retry,
            );
            let url = config.repo_url.clone();
            let git_ref = config.git_ref.clone();
            return cache
                .ensure(
                    move |dest| async move {
                        fetcher.fetch(&url, &git_ref, &dest).await.map(|_| ())
                    },
                    &identity.run_id,
                    task.index,
                    config.workspace_timeout,
                )
                .await;
        }

        let dest = config
            .scratch_root
            .join(format!("checkout-{}", sanitize_id(&identity.run_id)))
            .join(name);
        fetcher
            .fetch(&config.repo_url, &config.git_ref, &dest)
            .await
            .map_err(|cause| CoordinationError::Collaborator {
                name: "source fetcher",
                cause,
            })
    }

    /// Remove the marker of a failed run so the next invocation mints a fresh id
    async fn clear_identity_marker(&self, identity: &RunIdentity) {
        let marker = OnceBarrier::new(
            Arc::clone(&self.store),
            run_id_marker(&identity.base_id),
            self.config.marker_poll_interval,
            self.config.retry,
        );
        match marker.clear().await {
            Ok(()) => info!("Cleared run id marker {} after a failed run", marker.key()),
            Err(e) => warn!("Failed to clear run id marker {}: {:#}", marker.key(), e),
        }
    }

    fn send(&self, event: TelemetryEvent) {
        if let Some(tx) = &self.telemetry_tx {
            let _ = tx.send(event);
        }
    }
}
