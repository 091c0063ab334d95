/// Telemetry events sent from the coordination components to the progress display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// The run id has been agreed upon
    IdentityResolved { run_id: String },
    /// This worker's partial artifact and receipt are in the store
    ShardPublished { worker_index: u32, exit_code: i32 },
    /// One listing of the completion barrier
    BarrierPolled { observed: usize, expected: usize },
    /// The final artifact was published
    MergeCompleted { final_keys: usize },
    /// Cleanup of intermediate state finished
    CleanupFinished { deleted: usize, failed: usize },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub run_id: Option<String>,
    pub shards_published: usize,
    pub failing_shards: usize,
    pub observed_shards: usize,
    pub expected_shards: usize,
    pub barrier_polls: usize,
    pub merged: bool,
    pub cleanup_deleted: usize,
    pub cleanup_failed: usize,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::IdentityResolved { run_id } => {
                self.run_id = Some(run_id.clone());
            }
            TelemetryEvent::ShardPublished { exit_code, .. } => {
                self.shards_published += 1;
                if *exit_code != 0 {
                    self.failing_shards += 1;
                }
            }
            TelemetryEvent::BarrierPolled { observed, expected } => {
                self.barrier_polls += 1;
                // the observed set only grows; ignore a lagging listing
                self.observed_shards = self.observed_shards.max(*observed);
                self.expected_shards = *expected;
            }
            TelemetryEvent::MergeCompleted { .. } => {
                self.merged = true;
            }
            TelemetryEvent::CleanupFinished { deleted, failed } => {
                self.cleanup_deleted += deleted;
                self.cleanup_failed += failed;
            }
        }
    }

    /// Fraction of expected shards observed at the barrier
    pub fn barrier_progress(&self) -> Option<f64> {
        if self.expected_shards == 0 {
            return None;
        }
        Some(self.observed_shards as f64 / self.expected_shards as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_progress_never_regresses() {
        let mut stats = ProgressStats::new();
        assert_eq!(stats.barrier_progress(), None);

        stats.update(&TelemetryEvent::BarrierPolled {
            observed: 3,
            expected: 4,
        });
        stats.update(&TelemetryEvent::BarrierPolled {
            observed: 2,
            expected: 4,
        });

        assert_eq!(stats.observed_shards, 3);
        assert_eq!(stats.barrier_polls, 2);
        assert_eq!(stats.barrier_progress(), Some(0.75));
    }

    #[test]
    fn test_failing_shards_are_counted() {
        let mut stats = ProgressStats::new();
        stats.update(&TelemetryEvent::ShardPublished {
            worker_index: 0,
            exit_code: 1,
        });
        stats.update(&TelemetryEvent::CleanupFinished {
            deleted: 9,
            failed: 1,
        });

        assert_eq!(stats.shards_published, 1);
        assert_eq!(stats.failing_shards, 1);
        assert_eq!(stats.cleanup_deleted, 9);
        assert_eq!(stats.cleanup_failed, 1);
    }
}
