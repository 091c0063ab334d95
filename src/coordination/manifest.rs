use serde::{Deserialize, Serialize};

/// Run identity marker written by worker 0 when no execution token exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMarker {
    pub run_id: String,
    pub expected_workers: u32,
    pub created_at: String, // ISO 8601
}

/// Workspace ready marker written by worker 0 after the archive upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMarker {
    pub archive_key: String,
    pub archive_bytes: u64,
    pub ready_at: String, // ISO 8601
}

/// The receipt written last by a worker, marking its partial artifact complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub worker_index: u32,
    pub total_workers: u32,
    /// Test executor exit code; non-zero means failing tests, not a broken run
    pub exit_code: i32,
    /// Payload keys relative to the worker's shard prefix
    pub files: Vec<String>,
    pub published_at: String, // ISO 8601
}

/// Aggregated test counts parsed from the merged results file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTotals {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub index: u32,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryLinks {
    pub html_index: String,
    pub junit: String,
}

/// The run summary published alongside the merged report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    pub started_at: String,  // ISO 8601
    pub finished_at: String, // ISO 8601
    pub duration_secs: u64,
    pub status: RunStatus,
    pub tests: TestTotals,
    pub shards: Vec<ShardStatus>,
    pub links: SummaryLinks,
}
