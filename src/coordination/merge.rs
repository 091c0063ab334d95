//! Merge coordination: worker 0 fans the partial artifacts back in
//!
//! Wait for every receipt, download the shards, hand them to the report
//! merger, publish the final artifact and clean up the intermediates. The
//! wait-download-merge-publish sequence is retried a bounded number of
//! times; a barrier timeout is final.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::barrier::CompletionBarrier;
use super::identity::{RunIdentity, sanitize_id};
use super::keys::{RunKeys, run_id_marker};
use super::manifest::{PublishReceipt, RunSummary, ShardStatus};
use super::once_barrier::OnceBarrier;
use super::publisher::collect_upload_entries;
use super::summary::{SummaryContext, build_summary, parse_junit_totals};
use crate::collaborators::{MergedReport, ReportMerger};
use crate::config;
use crate::error::{CoordinationError, CoordinationResult};
use crate::store::{BlobStore, RetryPolicy, retry};
use crate::telemetry::TelemetryEvent;

/// Timing knobs of the merge
#[derive(Debug, Clone, Copy)]
pub struct MergeSettings {
    pub barrier_poll_interval: Duration,
    pub barrier_timeout: Duration,
    pub attempts: u32,
    pub attempt_delay: Duration,
    pub retry: RetryPolicy,
    /// Lifetime of the signed links to the final report
    pub link_ttl: Duration,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            barrier_poll_interval: config::BARRIER_POLL_INTERVAL,
            barrier_timeout: config::BARRIER_TIMEOUT,
            attempts: config::MERGE_ATTEMPTS,
            attempt_delay: config::MERGE_RETRY_DELAY,
            retry: RetryPolicy::default(),
            link_ttl: config::SIGNED_LINK_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub key: String,
    pub reason: String,
}

/// What the best-effort cleanup managed to delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failures: Vec<CleanupFailure>,
}

/// Temporary read links to the final report, when the store can sign them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedLinks {
    pub html_index: Option<String>,
    pub junit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub run_id: String,
    pub shards: Vec<ShardStatus>,
    /// Every key of the published final artifact
    pub final_keys: Vec<String>,
    pub summary: RunSummary,
    pub links: SignedLinks,
    pub cleanup: CleanupReport,
}

pub struct MergeCoordinator {
    store: Arc<dyn BlobStore>,
    merger: Arc<dyn ReportMerger>,
    scratch_root: PathBuf,
    settings: MergeSettings,
    project: Option<String>,
    git_ref: Option<String>,
    telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl MergeCoordinator {
    pub fn new(
        store: Arc<dyn BlobStore>,
        merger: Arc<dyn ReportMerger>,
        scratch_root: impl Into<PathBuf>,
        settings: MergeSettings,
    ) -> Self {
        Self {
            store,
            merger,
            scratch_root: scratch_root.into(),
            settings,
            project: None,
            git_ref: None,
            telemetry_tx: None,
        }
    }

    /// Labels copied into the run summary
    pub fn with_labels(mut self, project: Option<String>, git_ref: Option<String>) -> Self {
        self.project = project;
        self.git_ref = git_ref;
        self
    }

    pub fn with_telemetry(mut self, tx: mpsc::UnboundedSender<TelemetryEvent>) -> Self {
        self.telemetry_tx = Some(tx);
        self
    }

    /// Run the fan-in for `identity`, expecting `expected_workers` receipts
    pub async fn merge(
        &self,
        identity: &RunIdentity,
        expected_workers: u32,
        started_at: DateTime<Utc>,
    ) -> CoordinationResult<MergeOutcome> {
        let keys = RunKeys::new(&identity.run_id);
        let attempts = self.settings.attempts.max(1);
        let mut attempt = 0;

        let (shards, final_keys, summary) = loop {
            attempt += 1;
            match self.attempt(&keys, expected_workers, started_at).await {
                Ok(result) => break result,
                Err(e) if e.is_timeout() || matches!(e, CoordinationError::Config(_)) => {
                    return Err(e);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Merge attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, attempts, e, self.settings.attempt_delay
                    );
                    tokio::time::sleep(self.settings.attempt_delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        self.send(TelemetryEvent::MergeCompleted {
            final_keys: final_keys.len(),
        });
        info!(
            "Final report published under {} ({} objects)",
            keys.final_prefix(),
            final_keys.len()
        );

        let links = SignedLinks {
            html_index: self.sign(&summary.links.html_index).await,
            junit: self.sign(&summary.links.junit).await,
        };

        let cleanup = self.cleanup(&keys, identity).await;
        self.send(TelemetryEvent::CleanupFinished {
            deleted: cleanup.deleted,
            failed: cleanup.failures.len(),
        });

        Ok(MergeOutcome {
            run_id: identity.run_id.clone(),
            shards,
            final_keys,
            summary,
            links,
            cleanup,
        })
    }

    async fn attempt(
        &self,
        keys: &RunKeys,
        expected_workers: u32,
        started_at: DateTime<Utc>,
    ) -> CoordinationResult<(Vec<ShardStatus>, Vec<String>, RunSummary)> {
        let barrier = CompletionBarrier::new(Arc::clone(&self.store), self.telemetry_tx.clone());
        let observed = barrier
            .await_all(
                keys.run_id(),
                expected_workers,
                self.settings.barrier_poll_interval,
                self.settings.barrier_timeout,
            )
            .await?;

        let work_dir = self
            .scratch_root
            .join(format!("merge-{}", sanitize_id(keys.run_id())));
        if fs::try_exists(&work_dir).await.unwrap_or(false) {
            fs::remove_dir_all(&work_dir)
                .await
                .map_err(|e| CoordinationError::infra("reset merge scratch", e.into()))?;
        }
        let download_dir = work_dir.join("download");
        let output_dir = work_dir.join("merged");
        for dir in [&download_dir, &output_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| CoordinationError::infra("create merge scratch", e.into()))?;
        }

        let shards = self.download(keys, &observed, &download_dir).await?;

        info!("Merging {} shard(s)", shards.len());
        let report = self
            .merger
            .merge(&download_dir, &output_dir)
            .await
            .map_err(|cause| CoordinationError::Collaborator {
                name: "report merger",
                cause,
            })?;

        let (final_keys, summary) = self
            .publish_final(keys, &report, shards.clone(), started_at)
            .await?;
        Ok((shards, final_keys, summary))
    }

    /// Download every shard object, checking each receipt's files arrived
    async fn download(
        &self,
        keys: &RunKeys,
        observed: &BTreeSet<u32>,
        download_dir: &Path,
    ) -> CoordinationResult<Vec<ShardStatus>> {
        let shards_prefix = keys.shards_prefix();
        let listed = self
            .store
            .list(&shards_prefix)
            .await
            .map_err(|e| CoordinationError::infra(format!("list {}", shards_prefix), e))?;
        let listed_set: BTreeSet<&str> = listed.iter().map(String::as_str).collect();

        let mut shards = Vec::with_capacity(observed.len());
        for &index in observed {
            let receipt = self.read_receipt(keys, index).await?;
            if let Some(missing) = receipt
                .files
                .iter()
                .find(|f| !listed_set.contains(keys.shard_object(index, f).as_str()))
            {
                return Err(CoordinationError::infra(
                    format!("download shard {}", index),
                    anyhow!("{} is named by the receipt but not yet listed", missing),
                ));
            }
            shards.push(ShardStatus {
                index,
                exit_code: receipt.exit_code,
            });
        }

        let mut downloaded = 0;
        for key in &listed {
            let Some(index) = keys.shard_worker_index(key) else {
                continue;
            };
            if !observed.contains(&index) || keys.receipt_worker_index(key).is_some() {
                continue;
            }
            let Some(relative) = key.strip_prefix(&shards_prefix) else {
                continue;
            };

            let dest = download_dir.join(relative);
            retry(&format!("download {}", key), self.settings.retry, || {
                self.store.get_to_file(key, &dest)
            })
            .await
            .map_err(|e| CoordinationError::infra(format!("download {}", key), e))?;
            downloaded += 1;
        }

        info!(
            "Downloaded {} object(s) from {} shard(s) into {}",
            downloaded,
            shards.len(),
            download_dir.display()
        );
        Ok(shards)
    }

    async fn read_receipt(&self, keys: &RunKeys, index: u32) -> CoordinationResult<PublishReceipt> {
        let key = keys.receipt(index);
        let bytes = self
            .store
            .get(&key)
            .await
            .map_err(|e| CoordinationError::infra(format!("read {}", key), e))?
            .ok_or_else(|| {
                CoordinationError::infra(format!("read {}", key), anyhow!("receipt disappeared"))
            })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CoordinationError::infra(format!("parse {}", key), e.into()))
    }

    async fn publish_final(
        &self,
        keys: &RunKeys,
        report: &MergedReport,
        shards: Vec<ShardStatus>,
        started_at: DateTime<Utc>,
    ) -> CoordinationResult<(Vec<String>, RunSummary)> {
        let mut final_keys = Vec::new();

        let html_entries = collect_upload_entries(&report.html_dir)
            .await
            .map_err(|e| CoordinationError::infra("read merged report", e))?;
        for entry in &html_entries {
            let key = keys.final_html(&entry.relative_key);
            self.upload_file(&key, &entry.path).await?;
            final_keys.push(key);
        }

        let junit_key = keys.final_junit();
        self.upload_file(&junit_key, &report.results_file).await?;
        final_keys.push(junit_key);

        let junit = fs::read_to_string(&report.results_file)
            .await
            .map_err(|e| CoordinationError::infra("read merged results", e.into()))?;
        let summary = build_summary(
            SummaryContext {
                run_id: keys.run_id().to_string(),
                project: self.project.clone(),
                git_ref: self.git_ref.clone(),
                started_at,
                finished_at: Utc::now(),
            },
            parse_junit_totals(&junit),
            shards,
        );

        let summary_key = keys.final_summary();
        let bytes = serde_json::to_vec_pretty(&summary).map_err(|e| CoordinationError::Upload {
            key: summary_key.clone(),
            cause: e.into(),
        })?;
        retry(&format!("upload {}", summary_key), self.settings.retry, || {
            self.store.put(&summary_key, bytes.clone())
        })
        .await
        .map_err(|cause| CoordinationError::Upload {
            key: summary_key.clone(),
            cause,
        })?;
        final_keys.push(summary_key);

        info!(
            "Summary: {} total, {} passed, {} failed, {} skipped ({:?})",
            summary.tests.total,
            summary.tests.passed,
            summary.tests.failed,
            summary.tests.skipped,
            summary.status
        );
        Ok((final_keys, summary))
    }

    async fn upload_file(&self, key: &str, path: &Path) -> CoordinationResult<()> {
        retry(&format!("upload {}", key), self.settings.retry, || {
            self.store.put_file(key, path)
        })
        .await
        .map_err(|cause| CoordinationError::Upload {
            key: key.to_string(),
            cause,
        })?;
        debug!("Uploaded {}", key);
        Ok(())
    }

    /// Best-effort removal of partial artifacts, workspace cache and identity marker
    async fn cleanup(&self, keys: &RunKeys, identity: &RunIdentity) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut targets = Vec::new();

        for prefix in [keys.shards_prefix(), keys.workspace_prefix()] {
            match self.store.list(&prefix).await {
                Ok(listed) => targets.extend(listed),
                Err(e) => report.failures.push(CleanupFailure {
                    key: prefix,
                    reason: format!("{:#}", e),
                }),
            }
        }
        for key in targets {
            match self.store.delete(&key).await {
                Ok(()) => report.deleted += 1,
                Err(e) => report.failures.push(CleanupFailure {
                    key,
                    reason: format!("{:#}", e),
                }),
            }
        }

        if identity.execution_token.is_none() {
            let marker = OnceBarrier::new(
                Arc::clone(&self.store),
                run_id_marker(&identity.base_id),
                self.settings.barrier_poll_interval,
                self.settings.retry,
            );
            match marker.clear().await {
                Ok(()) => report.deleted += 1,
                Err(e) => report.failures.push(CleanupFailure {
                    key: marker.key().to_string(),
                    reason: format!("{:#}", e),
                }),
            }
        }

        for failure in &report.failures {
            warn!("Cleanup failed for {}: {}", failure.key, failure.reason);
        }
        info!(
            "Cleanup removed {} object(s), {} failure(s)",
            report.deleted,
            report.failures.len()
        );
        report
    }

    /// Signing failures only cost the link, never the merge
    async fn sign(&self, key: &str) -> Option<String> {
        match self.store.presign(key, self.settings.link_ttl).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Failed to sign a link to {}: {:#}", key, e);
                None
            }
        }
    }

    fn send(&self, event: TelemetryEvent) {
        if let Some(tx) = &self.telemetry_tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::publisher::ArtifactPublisher;
    use crate::store::MemoryBlobStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Memory store whose listing leaves out one key for the first few calls
    struct LaggingStore {
        inner: MemoryBlobStore,
        hidden: String,
        lagging_lists: AtomicU32,
        lists: AtomicU32,
    }

    #[async_trait]
    impl BlobStore for LaggingStore {
        async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
            self.inner.put(key, bytes).await
        }

        async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn exists(&self, key: &str) -> anyhow::Result<bool> {
            self.inner.exists(key).await
        }

        async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            let mut keys = self.inner.list(prefix).await?;
            let lagging = self
                .lagging_lists
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lagging {
                keys.retain(|k| k != &self.hidden);
            }
            Ok(keys)
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.inner.delete(key).await
        }

        fn describe(&self) -> String {
            "lagging://".to_string()
        }
    }

    /// Memory store that hands out fake signed links
    struct SigningStore(MemoryBlobStore);

    #[async_trait]
    impl BlobStore for SigningStore {
        async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
            self.0.put(key, bytes).await
        }

        async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            self.0.get(key).await
        }

        async fn exists(&self, key: &str) -> anyhow::Result<bool> {
            self.0.exists(key).await
        }

        async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
            self.0.list(prefix).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.0.delete(key).await
        }

        fn describe(&self) -> String {
            "signing://".to_string()
        }

        async fn presign(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<String>> {
            Ok(Some(format!("https://signed.example/{}?ttl={}", key, ttl.as_secs())))
        }
    }

    /// Writes a tiny report listing the zip files it was handed
    struct ListingMerger {
        calls: AtomicU32,
        fail_first: bool,
    }

    impl ListingMerger {
        fn new(fail_first: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl ReportMerger for ListingMerger {
        async fn merge(&self, partials_dir: &Path, output_dir: &Path) -> anyhow::Result<MergedReport> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 && self.fail_first {
                return Err(anyhow!("merge tool crashed"));
            }
            let entries = collect_upload_entries(partials_dir).await?;
            let names: Vec<String> = entries.into_iter().map(|e| e.relative_key).collect();

            let html_dir = output_dir.join("html");
            fs::create_dir_all(html_dir.join("data")).await?;
            fs::write(html_dir.join("index.html"), names.join("\n")).await?;
            fs::write(html_dir.join("data/report.json"), "{}").await?;

            let results_file = output_dir.join("results.xml");
            fs::write(
                &results_file,
                format!(r#"<testsuites><testsuite tests="{}" failures="0" skipped="0"></testsuite></testsuites>"#, names.len()),
            )
            .await?;
            Ok(MergedReport {
                html_dir,
                results_file,
            })
        }
    }

    fn identity(run_id: &str) -> RunIdentity {
        RunIdentity {
            base_id: "suite".to_string(),
            execution_token: None,
            run_id: run_id.to_string(),
        }
    }

    fn fast_settings() -> MergeSettings {
        MergeSettings {
            barrier_poll_interval: Duration::from_millis(10),
            barrier_timeout: Duration::from_millis(300),
            attempts: 3,
            attempt_delay: Duration::from_millis(10),
            retry: RetryPolicy::none(),
            link_ttl: Duration::from_secs(600),
        }
    }

    async fn publish_shards(store: &Arc<MemoryBlobStore>, run_id: &str, count: u32, dir: &Path) {
        publish_into(store.clone(), run_id, count, dir).await;
    }

    async fn publish_into(store: Arc<dyn BlobStore>, run_id: &str, count: u32, dir: &Path) {
        let publisher = ArtifactPublisher::new(store, RetryPolicy::none());
        for index in 0..count {
            let artifact = dir.join(format!("report-{}.zip", index));
            fs::write(&artifact, format!("blob {}", index)).await.unwrap();
            publisher
                .publish(&artifact, run_id, index, count, 0)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_merge_publishes_final_and_cleans_up() {
        let store = Arc::new(MemoryBlobStore::new());
        let dir = TempDir::new().unwrap();
        publish_shards(&store, "suite-r1", 3, dir.path()).await;
        store.put("suite-r1/workspace/workspace.tgz", b"tgz".to_vec()).await.unwrap();
        store.put("suite/_run_id.json", b"{}".to_vec()).await.unwrap();

        let coordinator = MergeCoordinator::new(
            store.clone(),
            Arc::new(ListingMerger::new(false)),
            dir.path().join("scratch"),
            fast_settings(),
        );
        let outcome = coordinator
            .merge(&identity("suite-r1"), 3, Utc::now())
            .await
            .unwrap();

        assert_eq!(outcome.shards.len(), 3);
        assert_eq!(outcome.summary.tests.total, 3);
        assert!(outcome.cleanup.failures.is_empty());

        let remaining = store.list("").await.unwrap();
        assert_eq!(
            remaining,
            vec![
                "suite-r1/final/html/data/report.json".to_string(),
                "suite-r1/final/html/index.html".to_string(),
                "suite-r1/final/junit.xml".to_string(),
                "suite-r1/final/summary.json".to_string(),
            ]
        );
        assert_eq!(outcome.final_keys.len(), 4);
        assert_eq!(outcome.links, SignedLinks::default());
    }

    #[tokio::test]
    async fn test_payload_missing_from_listing_is_retried() {
        let dir = TempDir::new().unwrap();
        // one listing for the barrier plus one for the download, i.e. the whole first attempt
        let store = Arc::new(LaggingStore {
            inner: MemoryBlobStore::new(),
            hidden: "suite-r4/shards/shard-1/report-1.zip".to_string(),
            lagging_lists: AtomicU32::new(2),
            lists: AtomicU32::new(0),
        });
        publish_into(store.clone(), "suite-r4", 2, dir.path()).await;

        let merger = Arc::new(ListingMerger::new(false));
        let coordinator = MergeCoordinator::new(
            store.clone(),
            merger.clone(),
            dir.path().join("scratch"),
            fast_settings(),
        );
        let outcome = coordinator
            .merge(&identity("suite-r4"), 2, Utc::now())
            .await
            .unwrap();

        assert_eq!(merger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.summary.tests.total, 2);
        // two listings per attempt over two attempts, then two for cleanup
        assert_eq!(store.lists.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_signed_links_point_at_final_report() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SigningStore(MemoryBlobStore::new()));
        publish_into(store.clone(), "suite-r5", 1, dir.path()).await;

        let coordinator = MergeCoordinator::new(
            store.clone(),
            Arc::new(ListingMerger::new(false)),
            dir.path().join("scratch"),
            fast_settings(),
        );
        let outcome = coordinator
            .merge(&identity("suite-r5"), 1, Utc::now())
            .await
            .unwrap();

        assert_eq!(
            outcome.links,
            SignedLinks {
                html_index: Some(
                    "https://signed.example/suite-r5/final/html/index.html?ttl=600".to_string()
                ),
                junit: Some("https://signed.example/suite-r5/final/junit.xml?ttl=600".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_merger_failure_is_retried() {
        let store = Arc::new(MemoryBlobStore::new());
        let dir = TempDir::new().unwrap();
        publish_shards(&store, "suite-r2", 2, dir.path()).await;

        let merger = Arc::new(ListingMerger::new(true));
        let coordinator = MergeCoordinator::new(
            store.clone(),
            merger.clone(),
            dir.path().join("scratch"),
            fast_settings(),
        );
        coordinator
            .merge(&identity("suite-r2"), 2, Utc::now())
            .await
            .unwrap();

        assert_eq!(merger.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_barrier_timeout_is_not_retried() {
        let store = Arc::new(MemoryBlobStore::new());
        let dir = TempDir::new().unwrap();
        publish_shards(&store, "suite-r3", 1, dir.path()).await;

        let merger = Arc::new(ListingMerger::new(false));
        let coordinator = MergeCoordinator::new(
            store.clone(),
            merger.clone(),
            dir.path().join("scratch"),
            fast_settings(),
        );
        let err = coordinator
            .merge(&identity("suite-r3"), 2, Utc::now())
            .await
            .unwrap_err();

        assert!(err.is_timeout(), "{}", err);
        assert_eq!(merger.calls.load(Ordering::SeqCst), 0);
        // nothing is cleaned up when the merge never happened
        assert!(store.exists("suite-r3/shards/shard-0/_COMPLETE.json").await.unwrap());
    }
}
