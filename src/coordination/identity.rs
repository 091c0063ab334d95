//! Run identity: getting every worker of one invocation onto the same run id
//!
//! With an execution token from the launcher, every worker derives the id
//! locally. Without one, worker 0 mints an id and announces it through a
//! once-barrier marker that the other workers poll.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

use super::keys;
use super::manifest::RunMarker;
use super::once_barrier::OnceBarrier;
use crate::config;
use crate::error::{CoordinationError, CoordinationResult};
use crate::store::{BlobStore, RetryPolicy};

/// The agreed identity of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub base_id: String,
    pub execution_token: Option<String>,
    pub run_id: String,
}

/// Replace every run of characters outside `[A-Za-z0-9._-]` with one `-`
pub fn sanitize_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;

    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }

    out
}

/// Repository name from a clone URL: last path segment without `.git`
pub fn repo_name_from_url(url: &str) -> String {
    let clean = url.trim_end_matches('/');
    let last = clean
        .rsplit(['/', ':'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("repo");

    // `.git` is ASCII, so cutting four bytes stays on a char boundary
    let bytes = last.as_bytes();
    let name = if bytes.len() > 4 && bytes[bytes.len() - 4..].eq_ignore_ascii_case(b".git") {
        &last[..last.len() - 4]
    } else {
        last
    };

    if name.is_empty() { "repo" } else { name }.to_string()
}

/// Run id shared by every worker that sees the same execution token
pub fn token_run_id(base_id: &str, token: &str) -> String {
    format!("{}-{}", base_id, sanitize_id(token))
}

/// Run id minted by worker 0: base, UTC timestamp and a short random suffix
pub fn minted_run_id(base_id: &str) -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("{}-{}-{}", base_id, stamp, suffix)
}

pub struct RunIdentityCoordinator {
    store: Arc<dyn BlobStore>,
    execution_token: Option<String>,
    poll_interval: Duration,
    retry: RetryPolicy,
    started_at: DateTime<Utc>,
    marker_tolerance: Duration,
    resolved: OnceCell<RunIdentity>,
}

impl RunIdentityCoordinator {
    pub fn new(
        store: Arc<dyn BlobStore>,
        execution_token: Option<String>,
        poll_interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            execution_token: execution_token.filter(|t| !t.trim().is_empty()),
            poll_interval,
            retry,
            started_at: Utc::now(),
            marker_tolerance: config::IDENTITY_MARKER_TOLERANCE,
            resolved: OnceCell::new(),
        }
    }

    /// Followers reject markers created before `started_at - tolerance`
    pub fn with_freshness(mut self, started_at: DateTime<Utc>, tolerance: Duration) -> Self {
        self.started_at = started_at;
        self.marker_tolerance = tolerance;
        self
    }

    /// Oldest `created_at` a follower still accepts
    fn marker_cutoff(&self) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.marker_tolerance)
            .ok()
            .and_then(|tolerance| self.started_at.checked_sub_signed(tolerance))
    }

    /// Resolve the run identity, agreeing with every other worker of this invocation
    ///
    /// The first successful result is cached; later calls return it unchanged.
    pub async fn generate(
        &self,
        base_id: &str,
        worker_index: u32,
        total_workers: u32,
        timeout: Duration,
    ) -> CoordinationResult<RunIdentity> {
        let identity = self
            .resolved
            .get_or_try_init(|| self.resolve(base_id, worker_index, total_workers, timeout))
            .await?;
        Ok(identity.clone())
    }

    async fn resolve(
        &self,
        base_id: &str,
        worker_index: u32,
        total_workers: u32,
        timeout: Duration,
    ) -> CoordinationResult<RunIdentity> {
        let base_id = sanitize_id(base_id);
        if base_id.is_empty() {
            return Err(CoordinationError::config("base id is empty"));
        }

        if let Some(token) = &self.execution_token {
            let run_id = token_run_id(&base_id, token);
            info!("Run id derived from execution token: {}", run_id);
            return Ok(RunIdentity {
                base_id,
                execution_token: Some(token.clone()),
                run_id,
            });
        }

        let barrier = OnceBarrier::new(
            Arc::clone(&self.store),
            keys::run_id_marker(&base_id),
            self.poll_interval,
            self.retry,
        );

        let run_id = if worker_index == 0 {
            let marker = RunMarker {
                run_id: minted_run_id(&base_id),
                expected_workers: total_workers,
                created_at: Utc::now().to_rfc3339(),
            };
            barrier.announce(&marker).await?;
            info!("Announced run id {} at {}", marker.run_id, barrier.key());
            marker.run_id
        } else {
            info!("Waiting for run id marker {}", barrier.key());
            let cutoff = self.marker_cutoff();
            let marker: RunMarker = barrier
                .await_matching(timeout, |marker: &RunMarker| {
                    accept_marker(marker, total_workers, cutoff)
                })
                .await?;
            info!("Read run id {} from marker", marker.run_id);
            marker.run_id
        };

        Ok(RunIdentity {
            base_id,
            execution_token: None,
            run_id,
        })
    }
}

/// A follower only trusts a marker from its own invocation
fn accept_marker(
    marker: &RunMarker,
    total_workers: u32,
    cutoff: Option<DateTime<Utc>>,
) -> Result<(), String> {
    if marker.expected_workers != total_workers {
        return Err(format!(
            "marker expects {} workers, this invocation has {}",
            marker.expected_workers, total_workers
        ));
    }

    let Some(cutoff) = cutoff else {
        return Ok(());
    };
    let created_at = DateTime::parse_from_rfc3339(&marker.created_at)
        .map_err(|e| format!("unparseable created_at {:?}: {}", marker.created_at, e))?;
    if created_at < cutoff {
        return Err(format!(
            "marker created at {} predates this invocation",
            marker.created_at
        ));
    }
    Ok(())
}
