//! Key naming convention for everything a run writes to the blob store
//!
//! Layout:
//!   {base_id}/_run_id.json                          run identity marker
//!   {run_id}/workspace/workspace.tgz                workspace archive
//!   {run_id}/workspace/_READY.json                  workspace ready marker
//!   {run_id}/shards/shard-{index}/...               partial artifact payload
//!   {run_id}/shards/shard-{index}/_COMPLETE.json    publish receipt
//!   {run_id}/final/html/...                         merged human report
//!   {run_id}/final/junit.xml                        merged results file
//!   {run_id}/final/summary.json                     run summary

use crate::store::join_key;

pub const RUN_ID_MARKER: &str = "_run_id.json";
pub const READY_MARKER: &str = "_READY.json";
pub const RECEIPT_NAME: &str = "_COMPLETE.json";
pub const WORKSPACE_ARCHIVE: &str = "workspace.tgz";

const SHARD_DIR_PREFIX: &str = "shard-";

/// Key of the run identity marker for a base id
pub fn run_id_marker(base_id: &str) -> String {
    join_key(&[base_id, RUN_ID_MARKER])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKeys {
    run_id: String,
}

impl RunKeys {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Prefix under which every worker publishes; ends with `/`
    pub fn shards_prefix(&self) -> String {
        format!("{}/", join_key(&[&self.run_id, "shards"]))
    }

    /// Namespace owned by one worker; ends with `/`
    pub fn shard_prefix(&self, worker_index: u32) -> String {
        format!("{}{}{}/", self.shards_prefix(), SHARD_DIR_PREFIX, worker_index)
    }

    pub fn shard_object(&self, worker_index: u32, relative: &str) -> String {
        join_key(&[&self.shard_prefix(worker_index), relative])
    }

    pub fn receipt(&self, worker_index: u32) -> String {
        self.shard_object(worker_index, RECEIPT_NAME)
    }

    /// Prefix of the workspace cache intermediates; ends with `/`
    pub fn workspace_prefix(&self) -> String {
        format!("{}/", join_key(&[&self.run_id, "workspace"]))
    }

    pub fn workspace_archive(&self) -> String {
        join_key(&[&self.workspace_prefix(), WORKSPACE_ARCHIVE])
    }

    pub fn workspace_ready(&self) -> String {
        join_key(&[&self.workspace_prefix(), READY_MARKER])
    }

    pub fn final_prefix(&self) -> String {
        format!("{}/", join_key(&[&self.run_id, "final"]))
    }

    pub fn final_html(&self, relative: &str) -> String {
        join_key(&[&self.final_prefix(), "html", relative])
    }

    pub fn final_junit(&self) -> String {
        join_key(&[&self.final_prefix(), "junit.xml"])
    }

    pub fn final_summary(&self) -> String {
        join_key(&[&self.final_prefix(), "summary.json"])
    }

    /// Extract the worker index from a publish receipt key
    ///
    /// Only `{run_id}/shards/shard-{index}/_COMPLETE.json` matches; payload
    /// objects and foreign keys return `None`.
    pub fn receipt_worker_index(&self, key: &str) -> Option<u32> {
        let rest = key.strip_prefix(&self.shards_prefix())?;
        let (shard_dir, file) = rest.split_once('/')?;
        if file != RECEIPT_NAME {
            return None;
        }
        parse_shard_dir(shard_dir)
    }

    /// Extract the worker index from any key inside the shards prefix
    pub fn shard_worker_index(&self, key: &str) -> Option<u32> {
        let rest = key.strip_prefix(&self.shards_prefix())?;
        let (shard_dir, _) = rest.split_once('/')?;
        parse_shard_dir(shard_dir)
    }
}

fn parse_shard_dir(dir: &str) -> Option<u32> {
    let digits = dir.strip_prefix(SHARD_DIR_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
