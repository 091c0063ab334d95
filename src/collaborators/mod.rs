//! External collaborators of a worker
//!
//! Fetching sources, running the test runner and merging reports are
//! mechanical wrappers around third-party tools. The coordination code only
//! talks to them through these traits; the process-backed implementations in
//! the submodules are what the `shard-worker` binary wires in.

pub mod git;
pub mod playwright;
mod process;

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::coordination::ShardSpec;

pub use git::GitFetcher;
pub use playwright::{PlaywrightExecutor, PlaywrightMerger};

/// Produces a local checkout with dependencies installed
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch `url` at `git_ref` into `dest` and return the checkout root
    async fn fetch(&self, url: &str, git_ref: &str, dest: &Path) -> Result<PathBuf>;
}

/// Result of running one shard of the suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// File or directory holding the shard's partial report
    pub artifact_path: PathBuf,
    /// Non-zero means failing tests, not an infrastructure error
    pub exit_code: i32,
}

/// Runs one shard of the test suite
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(
        &self,
        shard: ShardSpec,
        source_dir: &Path,
        output_dir: &Path,
    ) -> Result<ExecutionResult>;
}

/// Combined report produced from every partial artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedReport {
    /// Directory tree of the human-readable report
    pub html_dir: PathBuf,
    /// Machine-readable results file (JUnit XML)
    pub results_file: PathBuf,
}

/// Merges the downloaded partial artifacts into one report
#[async_trait]
pub trait ReportMerger: Send + Sync {
    async fn merge(&self, partials_dir: &Path, output_dir: &Path) -> Result<MergedReport>;
}
