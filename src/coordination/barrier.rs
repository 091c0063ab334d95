//! Completion barrier: wait until every expected worker has published
//!
//! The barrier repeatedly lists the run's shard prefix and counts distinct
//! receipt keys. Receipts are written once and never change, so the observed
//! set only grows and the threshold, once crossed, stays crossed. The wait is
//! bounded by a timeout only: a worker that never publishes makes the barrier
//! fail, it does not make it hang.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::keys::RunKeys;
use crate::error::{CoordinationError, CoordinationResult};
use crate::store::BlobStore;
use crate::telemetry::TelemetryEvent;

pub struct CompletionBarrier {
    store: Arc<dyn BlobStore>,
    telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl CompletionBarrier {
    pub fn new(
        store: Arc<dyn BlobStore>,
        telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
    ) -> Self {
        Self {
            store,
            telemetry_tx,
        }
    }

    /// One listing: worker indices in `[0, expected_count)` with a receipt
    pub async fn observe(
        &self,
        keys: &RunKeys,
        expected_count: u32,
    ) -> anyhow::Result<BTreeSet<u32>> {
        let listed = self.store.list(&keys.shards_prefix()).await?;
        Ok(listed
            .iter()
            .filter_map(|key| keys.receipt_worker_index(key))
            .filter(|index| *index < expected_count)
            .collect())
    }

    /// Block until `expected_count` distinct workers have published
    ///
    /// Fails with `Timeout` no earlier than `timeout` and no later than
    /// `timeout + poll_interval`, or with `Infra` when the last listing before
    /// the deadline failed.
    pub async fn await_all(
        &self,
        run_id: &str,
        expected_count: u32,
        poll_interval: Duration,
        timeout: Duration,
    ) -> CoordinationResult<BTreeSet<u32>> {
        let keys = RunKeys::new(run_id);
        let start = Instant::now();
        let mut observed = BTreeSet::new();

        loop {
            let last_error = match self.observe(&keys, expected_count).await {
                Ok(current) => {
                    observed.extend(current);
                    self.send(TelemetryEvent::BarrierPolled {
                        observed: observed.len(),
                        expected: expected_count as usize,
                    });
                    info!(
                        "Waiting for shards: {}/{} present under {}",
                        observed.len(),
                        expected_count,
                        keys.shards_prefix()
                    );

                    if observed.len() >= expected_count as usize {
                        return Ok(observed);
                    }
                    None
                }
                Err(e) => {
                    warn!("Failed to list {}: {:#}", keys.shards_prefix(), e);
                    Some(e)
                }
            };

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(match last_error {
                    Some(e) => CoordinationError::infra(format!("list {}", keys.shards_prefix()), e),
                    None => {
                        let missing: Vec<String> = (0..expected_count)
                            .filter(|i| !observed.contains(i))
                            .map(|i| i.to_string())
                            .collect();
                        CoordinationError::timeout(
                            format!(
                                "{}/{} shards under {} (missing: {})",
                                observed.len(),
                                expected_count,
                                keys.shards_prefix(),
                                missing.join(", ")
                            ),
                            elapsed,
                        )
                    }
                });
            }

            tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
        }
    }

    fn send(&self, event: TelemetryEvent) {
        if let Some(tx) = &self.telemetry_tx {
            let _ = tx.send(event);
        }
    }
}
