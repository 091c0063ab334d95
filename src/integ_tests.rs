//! Integration tests for multi-worker runs
//!
//! These tests run several workers concurrently against one shared store
//! (in-memory or a local directory) with fake collaborators in place of git
//! and Playwright, and check the fan-out / fan-in end to end.

#[cfg(test)]
mod tests {
    use crate::{
        collaborators::{
            ExecutionResult, MergedReport, ReportMerger, SourceFetcher, TestExecutor,
        },
        coordination::{
            ArtifactPublisher, CompletionBarrier, MergeCoordinator, MergeSettings, RunIdentity,
            RunIdentityCoordinator, ShardSpec, Worker, WorkerConfig, WorkerConfigBuilder,
            WorkerOutcome,
            keys::run_id_marker,
            manifest::{PublishReceipt, RunStatus, RunSummary},
            publisher::collect_upload_entries,
        },
        error::CoordinationError,
        store::{BlobStore, LocalBlobStore, MemoryBlobStore, RetryPolicy},
    };
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::fs;

    // ============ Test Helpers ============

    /// Writes a minimal checkout and counts how often it was asked to
    #[derive(Default)]
    struct FakeFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SourceFetcher for FakeFetcher {
        async fn fetch(&self, _url: &str, _git_ref: &str, dest: &Path) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(dest.join("tests")).await?;
            fs::write(dest.join("package.json"), r#"{"name":"suite"}"#).await?;
            fs::write(dest.join("tests/login.spec.ts"), "test('login')").await?;
            Ok(dest.to_path_buf())
        }
    }

    /// Produces one blob zip per shard; `failing` shards exit with 1
    struct FakeExecutor {
        failing: BTreeSet<u32>,
    }

    impl FakeExecutor {
        fn passing() -> Self {
            Self {
                failing: BTreeSet::new(),
            }
        }

        fn failing(indices: &[u32]) -> Self {
            Self {
                failing: indices.iter().copied().collect(),
            }
        }
    }

    #[async_trait]
    impl TestExecutor for FakeExecutor {
        async fn execute(
            &self,
            shard: ShardSpec,
            source_dir: &Path,
            output_dir: &Path,
        ) -> Result<ExecutionResult> {
            if !source_dir.join("tests/login.spec.ts").exists() {
                return Err(anyhow!("no checkout at {}", source_dir.display()));
            }
            let blob_dir = output_dir.join("blob-report");
            fs::create_dir_all(&blob_dir).await?;
            let zip = blob_dir.join(format!("report-{}.zip", shard.one_based()));
            fs::write(&zip, format!("blob for shard {}", shard.shard_arg())).await?;

            let exit_code = if self.failing.contains(&shard.index) { 1 } else { 0 };
            Ok(ExecutionResult {
                artifact_path: zip,
                exit_code,
            })
        }
    }

    /// Writes an HTML index listing the partial zips and one JUnit suite per zip
    struct FakeMerger;

    #[async_trait]
    impl ReportMerger for FakeMerger {
        async fn merge(&self, partials_dir: &Path, output_dir: &Path) -> Result<MergedReport> {
            let zips: Vec<String> = collect_upload_entries(partials_dir)
                .await?
                .into_iter()
                .map(|e| e.relative_key)
                .filter(|k| k.ends_with(".zip"))
                .collect();
            if zips.is_empty() {
                return Err(anyhow!("no partial reports"));
            }

            let html_dir = output_dir.join("playwright-report");
            fs::create_dir_all(&html_dir).await?;
            fs::write(html_dir.join("index.html"), zips.join("\n")).await?;

            let suites: String = zips
                .iter()
                .map(|z| format!(r#"<testsuite name="{}" tests="2" failures="0" skipped="0"></testsuite>"#, z))
                .collect();
            let results_file = output_dir.join("results.xml");
            fs::write(&results_file, format!("<testsuites>{}</testsuites>", suites)).await?;

            Ok(MergedReport {
                html_dir,
                results_file,
            })
        }
    }

    /// Store whose `delete` fails for keys ending with a given suffix
    struct FlakyDeleteStore {
        inner: MemoryBlobStore,
        fail_suffix: String,
    }

    #[async_trait]
    impl BlobStore for FlakyDeleteStore {
        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
            self.inner.put(key, bytes).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            if key.ends_with(&self.fail_suffix) {
                return Err(anyhow!("simulated delete failure for {}", key));
            }
            self.inner.delete(key).await
        }

        fn describe(&self) -> String {
            "flaky-delete://".to_string()
        }
    }

    fn fast_config(index: u32, count: u32, scratch: &Path) -> WorkerConfigBuilder {
        let mut builder = WorkerConfigBuilder::default();
        builder
            .worker_index(index)
            .worker_count(count)
            .base_id("suite")
            .repo_url("https://example.com/org/suite.git")
            .project("suite")
            .scratch_root(scratch.join(format!("worker-{}", index)))
            .marker_poll_interval(Duration::from_millis(10))
            .identity_timeout(Duration::from_secs(5))
            .workspace_timeout(Duration::from_secs(5))
            .barrier_poll_interval(Duration::from_millis(20))
            .barrier_timeout(Duration::from_secs(10))
            .retry(RetryPolicy::new(2, Duration::from_millis(5)))
            .merge_attempts(2)
            .merge_retry_delay(Duration::from_millis(20));
        builder
    }

    /// Run `count` workers concurrently and return their outcomes by index
    async fn run_workers(
        store: Arc<dyn BlobStore>,
        configs: Vec<WorkerConfig>,
        fetcher: Arc<FakeFetcher>,
        executor: Arc<FakeExecutor>,
    ) -> Vec<Result<WorkerOutcome, CoordinationError>> {
        let handles: Vec<_> = configs
            .into_iter()
            .map(|config| {
                let worker = Worker::new(
                    config,
                    Arc::clone(&store),
                    fetcher.clone(),
                    executor.clone(),
                    Arc::new(FakeMerger),
                );
                tokio::spawn(async move { worker.run().await })
            })
            .collect();

        let mut outcomes = Vec::new();
        for joined in futures::future::join_all(handles).await {
            outcomes.push(joined.unwrap());
        }
        outcomes
    }

    async fn read_json<T: serde::de::DeserializeOwned>(store: &dyn BlobStore, key: &str) -> T {
        let bytes = store.get(key).await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // ============ Scenario Tests ============

    #[tokio::test]
    async fn test_barrier_sees_all_four_shards_one_poll_after_last_publish() {
        let store = Arc::new(MemoryBlobStore::new());
        let dir = TempDir::new().unwrap();
        let publisher = ArtifactPublisher::new(store.clone(), RetryPolicy::none());

        for index in 0..3 {
            let artifact = dir.path().join(format!("report-{}.zip", index));
            fs::write(&artifact, format!("blob {}", index)).await.unwrap();
            publisher.publish(&artifact, "suite-a", index, 4, 0).await.unwrap();
        }

        let poll = Duration::from_millis(50);
        let barrier = CompletionBarrier::new(store.clone(), None);
        let waiter = tokio::spawn(async move {
            let observed = barrier
                .await_all("suite-a", 4, poll, Duration::from_secs(5))
                .await;
            (observed, Instant::now())
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        let artifact = dir.path().join("report-3.zip");
        fs::write(&artifact, "blob 3").await.unwrap();
        publisher.publish(&artifact, "suite-a", 3, 4, 0).await.unwrap();
        let landed = Instant::now();

        let (observed, returned) = waiter.await.unwrap();
        assert_eq!(observed.unwrap(), BTreeSet::from([0, 1, 2, 3]));
        assert!(
            returned.duration_since(landed) <= poll + Duration::from_millis(100),
            "barrier returned {:?} after the last publish",
            returned.duration_since(landed)
        );
    }

    #[tokio::test]
    async fn test_followers_agree_on_leader_run_id() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());

        let handles: Vec<_> = (0..4u32)
            .rev()
            .map(|index| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let coordinator = RunIdentityCoordinator::new(
                        store,
                        None,
                        Duration::from_millis(10),
                        RetryPolicy::none(),
                    );
                    coordinator
                        .generate("suite", index, 4, Duration::from_secs(5))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let identities: Vec<RunIdentity> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let run_ids: BTreeSet<&str> = identities.iter().map(|i| i.run_id.as_str()).collect();
        assert_eq!(run_ids.len(), 1, "workers disagreed: {:?}", run_ids);
        assert!(identities[0].run_id.starts_with("suite-"));
    }

    #[tokio::test]
    async fn test_cleanup_reports_single_delete_failure() {
        let store = Arc::new(FlakyDeleteStore {
            inner: MemoryBlobStore::new(),
            fail_suffix: "shard-1/report-1.zip".to_string(),
        });
        let dir = TempDir::new().unwrap();
        let publisher = ArtifactPublisher::new(store.clone(), RetryPolicy::none());
        for index in 0..3 {
            let artifact = dir.path().join(format!("report-{}.zip", index));
            fs::write(&artifact, format!("blob {}", index)).await.unwrap();
            publisher.publish(&artifact, "suite-c", index, 3, 0).await.unwrap();
        }

        let settings = MergeSettings {
            barrier_poll_interval: Duration::from_millis(10),
            barrier_timeout: Duration::from_secs(2),
            attempts: 1,
            attempt_delay: Duration::ZERO,
            retry: RetryPolicy::none(),
            link_ttl: Duration::from_secs(60),
        };
        let identity = RunIdentity {
            base_id: "suite".to_string(),
            execution_token: Some("exec-1".to_string()),
            run_id: "suite-c".to_string(),
        };
        let outcome = MergeCoordinator::new(
            store.clone(),
            Arc::new(FakeMerger),
            dir.path().join("scratch"),
            settings,
        )
        .merge(&identity, 3, Utc::now())
        .await
        .unwrap();

        // 3 payload files + 3 receipts, one of which could not be deleted
        assert_eq!(outcome.cleanup.deleted, 5);
        assert_eq!(outcome.cleanup.failures.len(), 1);
        assert_eq!(outcome.cleanup.failures[0].key, "suite-c/shards/shard-1/report-1.zip");

        let leftover = store.list("suite-c/shards/").await.unwrap();
        assert_eq!(leftover, vec!["suite-c/shards/shard-1/report-1.zip".to_string()]);
        assert!(store.exists("suite-c/final/summary.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_shard_still_publishes_and_merges() {
        let store_dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(store_dir.path()));

        let configs = (0..3)
            .map(|i| fast_config(i, 3, scratch.path()).build().unwrap())
            .collect();
        let fetcher = Arc::new(FakeFetcher::default());
        let outcomes = run_workers(
            Arc::clone(&store),
            configs,
            fetcher.clone(),
            Arc::new(FakeExecutor::failing(&[1])),
        )
        .await;

        let outcomes: Vec<WorkerOutcome> = outcomes.into_iter().map(|o| o.unwrap()).collect();
        assert_eq!(outcomes[1].exit_code, 1);
        assert_eq!(outcomes[1].receipt.exit_code, 1);
        assert!(outcomes[1].merge.is_none());

        let run_id = &outcomes[0].identity.run_id;
        assert!(outcomes.iter().all(|o| &o.identity.run_id == run_id));

        // the workspace cache fetched exactly once, on worker 0
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let merge = outcomes[0].merge.as_ref().unwrap();
        assert_eq!(merge.shards.len(), 3);
        assert_eq!(merge.summary.status, RunStatus::Failed);
        assert_eq!(merge.summary.tests.total, 6);
        assert!(merge.cleanup.failures.is_empty());

        let summary: RunSummary =
            read_json(store.as_ref(), &format!("{}/final/summary.json", run_id)).await;
        assert_eq!(&summary, &merge.summary);
        assert!(store.exists(&format!("{}/final/html/index.html", run_id)).await.unwrap());
        assert!(store.exists(&format!("{}/final/junit.xml", run_id)).await.unwrap());

        // intermediates are gone, only the final artifact remains
        let remaining = store.list("").await.unwrap();
        assert!(
            remaining.iter().all(|k| k.starts_with(&format!("{}/final/", run_id))),
            "unexpected leftovers: {:?}",
            remaining
        );
    }

    // ============ End to End Worker Tests ============

    #[tokio::test]
    async fn test_token_derived_run_without_workspace_cache() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let scratch = TempDir::new().unwrap();

        let configs = (0..2)
            .map(|i| {
                fast_config(i, 2, scratch.path())
                    .execution_token("exec 42")
                    .use_workspace_cache(false)
                    .build()
                    .unwrap()
            })
            .collect();
        let fetcher = Arc::new(FakeFetcher::default());
        let outcomes = run_workers(
            Arc::clone(&store),
            configs,
            fetcher.clone(),
            Arc::new(FakeExecutor::passing()),
        )
        .await;

        let outcomes: Vec<WorkerOutcome> = outcomes.into_iter().map(|o| o.unwrap()).collect();
        assert!(outcomes.iter().all(|o| o.identity.run_id == "suite-exec-42"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        let merge = outcomes[0].merge.as_ref().unwrap();
        assert_eq!(merge.summary.status, RunStatus::Passed);
        assert_eq!(merge.summary.git_ref.as_deref(), Some("main"));
        assert_eq!(merge.summary.project.as_deref(), Some("suite"));
        assert_eq!(
            merge.final_keys,
            vec![
                "suite-exec-42/final/html/index.html".to_string(),
                "suite-exec-42/final/junit.xml".to_string(),
                "suite-exec-42/final/summary.json".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_leader_does_not_leak_run_id_into_next_run() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let scratch = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let executor = Arc::new(FakeExecutor::passing());

        // run 1: worker 1 never starts, so the leader's barrier times out
        let lone_leader = fast_config(0, 2, &scratch.path().join("run-1"))
            .barrier_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let outcomes = run_workers(
            Arc::clone(&store),
            vec![lone_leader],
            fetcher.clone(),
            executor.clone(),
        )
        .await;
        let err = outcomes[0].as_ref().unwrap_err();
        assert!(err.is_timeout(), "{}", err);
        assert!(!store.exists(&run_id_marker("suite")).await.unwrap());

        // run 2: the follower is up before the new leader announces
        let run_2 = scratch.path().join("run-2");
        let follower = Worker::new(
            fast_config(1, 2, &run_2).build().unwrap(),
            Arc::clone(&store),
            fetcher.clone(),
            executor.clone(),
            Arc::new(FakeMerger),
        );
        let follower = tokio::spawn(async move { follower.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let leader = Worker::new(
            fast_config(0, 2, &run_2).build().unwrap(),
            Arc::clone(&store),
            fetcher.clone(),
            executor.clone(),
            Arc::new(FakeMerger),
        )
        .run()
        .await
        .unwrap();
        let follower = follower.await.unwrap().unwrap();

        assert_eq!(follower.identity.run_id, leader.identity.run_id);
        let merge = leader.merge.as_ref().unwrap();
        assert_eq!(merge.shards.len(), 2);
        assert_eq!(merge.summary.status, RunStatus::Passed);
    }

    #[tokio::test]
    async fn test_shards_partition_the_suite() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let scratch = TempDir::new().unwrap();

        let configs = (0..4)
            .map(|i| fast_config(i, 4, scratch.path()).build().unwrap())
            .collect();
        let outcomes = run_workers(
            Arc::clone(&store),
            configs,
            Arc::new(FakeFetcher::default()),
            Arc::new(FakeExecutor::passing()),
        )
        .await;

        let mut shard_args: Vec<String> = outcomes
            .iter()
            .map(|o| o.as_ref().unwrap().shard.shard_arg())
            .collect();
        shard_args.sort();
        assert_eq!(shard_args, vec!["1/4", "2/4", "3/4", "4/4"]);
    }

    #[tokio::test]
    async fn test_invalid_index_fails_before_any_io() {
        let store = Arc::new(MemoryBlobStore::new());
        let scratch = TempDir::new().unwrap();
        let config = fast_config(3, 3, scratch.path()).build().unwrap();

        let err = Worker::new(
            config,
            store.clone(),
            Arc::new(FakeFetcher::default()),
            Arc::new(FakeExecutor::passing()),
            Arc::new(FakeMerger),
        )
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, CoordinationError::Config(_)), "{}", err);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_republishing_a_shard_keeps_store_state() {
        let store = Arc::new(MemoryBlobStore::new());
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("report-1.zip");
        fs::write(&artifact, "blob").await.unwrap();

        let publisher = ArtifactPublisher::new(store.clone(), RetryPolicy::none());
        let first = publisher.publish(&artifact, "suite-r", 0, 1, 0).await.unwrap();
        let second = publisher.publish(&artifact, "suite-r", 0, 1, 0).await.unwrap();
        assert_eq!(first, second);

        let receipt: PublishReceipt =
            read_json(store.as_ref(), "suite-r/shards/shard-0/_COMPLETE.json").await;
        assert_eq!(receipt, first);
        assert_eq!(store.len().await, 2);
    }
}
