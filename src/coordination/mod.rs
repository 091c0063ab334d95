//! Fan-out / fan-in coordination of sharded test workers over a blob store

pub mod barrier;
pub mod identity;
pub mod keys;
pub mod manifest;
pub mod merge;
pub mod once_barrier;
pub mod publisher;
pub mod shard;
pub mod summary;
pub mod worker;
pub mod workspace;

use derive_builder::Builder;
use std::path::PathBuf;
use std::time::Duration;

use crate::config;
use crate::store::RetryPolicy;

pub use barrier::CompletionBarrier;
pub use identity::{RunIdentity, RunIdentityCoordinator};
pub use merge::{
    CleanupFailure, CleanupReport, MergeCoordinator, MergeOutcome, MergeSettings, SignedLinks,
};
pub use publisher::ArtifactPublisher;
pub use shard::{ShardSpec, WorkerTask, plan, recommended_shard_count};
pub use worker::{Worker, WorkerOutcome};
pub use workspace::WorkspaceCache;

/// Everything one worker process needs to know about its run
#[derive(Debug, Clone, Builder)]
pub struct WorkerConfig {
    pub worker_index: u32,
    pub worker_count: u32,
    /// Stable prefix shared by every invocation of the same suite
    #[builder(setter(into))]
    pub base_id: String,
    /// Launcher-provided id shared by every worker of one invocation
    #[builder(setter(into, strip_option), default)]
    pub execution_token: Option<String>,
    #[builder(setter(into))]
    pub repo_url: String,
    #[builder(setter(into), default = "\"main\".to_string()")]
    pub git_ref: String,
    #[builder(setter(into, strip_option), default)]
    pub project: Option<String>,
    #[builder(setter(into))]
    pub scratch_root: PathBuf,
    /// Fetch once on worker 0 and share the checkout as an archive
    #[builder(default = "true")]
    pub use_workspace_cache: bool,
    #[builder(default = "config::MARKER_POLL_INTERVAL")]
    pub marker_poll_interval: Duration,
    #[builder(default = "config::IDENTITY_TIMEOUT")]
    pub identity_timeout: Duration,
    /// Followers ignore identity markers older than their start minus this
    #[builder(default = "config::IDENTITY_MARKER_TOLERANCE")]
    pub identity_marker_tolerance: Duration,
    #[builder(default = "config::WORKSPACE_TIMEOUT")]
    pub workspace_timeout: Duration,
    #[builder(default = "config::BARRIER_POLL_INTERVAL")]
    pub barrier_poll_interval: Duration,
    #[builder(default = "config::BARRIER_TIMEOUT")]
    pub barrier_timeout: Duration,
    #[builder(default)]
    pub retry: RetryPolicy,
    #[builder(default = "config::MERGE_ATTEMPTS")]
    pub merge_attempts: u32,
    #[builder(default = "config::MERGE_RETRY_DELAY")]
    pub merge_retry_delay: Duration,
    #[builder(default = "config::SIGNED_LINK_TTL")]
    pub signed_link_ttl: Duration,
}

impl WorkerConfig {
    pub fn merge_settings(&self) -> MergeSettings {
        MergeSettings {
            barrier_poll_interval: self.barrier_poll_interval,
            barrier_timeout: self.barrier_timeout,
            attempts: self.merge_attempts,
            attempt_delay: self.merge_retry_delay,
            retry: self.retry,
            link_ttl: self.signed_link_ttl,
        }
    }
}
