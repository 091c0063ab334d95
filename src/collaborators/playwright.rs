//! Playwright-backed test execution and report merging

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use super::process::{run, run_checked};
use super::{ExecutionResult, MergedReport, ReportMerger, TestExecutor};
use crate::coordination::ShardSpec;
use crate::coordination::publisher::collect_upload_entries;

const EMPTY_JUNIT: &str = r#"<?xml version="1.0" encoding="UTF-8"?><testsuites></testsuites>"#;

/// Runs `npx playwright test --shard=i/N` with a blob reporter
#[derive(Debug, Clone)]
pub struct PlaywrightExecutor {
    /// Test directory relative to the checkout root
    pub test_dir: String,
}

impl Default for PlaywrightExecutor {
    fn default() -> Self {
        Self {
            test_dir: "tests".to_string(),
        }
    }
}

impl PlaywrightExecutor {
    /// Config that shards at process level and writes blob output to `blob_dir`
    fn render_config(test_dir: &Path, blob_dir: &Path) -> Result<String> {
        let test_dir = serde_json::to_string(&test_dir.to_string_lossy())?;
        let blob_dir = serde_json::to_string(&blob_dir.to_string_lossy())?;
        Ok(format!(
            "/** @type {{import('@playwright/test').PlaywrightTestConfig}} */\n\
             module.exports = {{\n  \
               testDir: {test_dir},\n  \
               fullyParallel: true,\n  \
               workers: 1,\n  \
               reporter: [\n    ['line'],\n    ['blob', {{ outputDir: {blob_dir} }}],\n  ],\n\
             }};\n"
        ))
    }
}

#[async_trait]
impl TestExecutor for PlaywrightExecutor {
    async fn execute(
        &self,
        shard: ShardSpec,
        source_dir: &Path,
        output_dir: &Path,
    ) -> Result<ExecutionResult> {
        let blob_dir = output_dir.join("blob-report");
        fs::create_dir_all(&blob_dir)
            .await
            .with_context(|| format!("Failed to create {}", blob_dir.display()))?;

        let config_path = output_dir.join("pw.blob.config.cjs");
        let config = Self::render_config(&source_dir.join(&self.test_dir), &blob_dir)?;
        fs::write(&config_path, config)
            .await
            .context("Failed to write Playwright config")?;

        info!(
            "Running shard {} in {} (blob output: {})",
            shard.shard_arg(),
            source_dir.display(),
            blob_dir.display()
        );

        let status = Command::new("npx")
            .arg("playwright")
            .arg("test")
            .arg(format!("--config={}", config_path.display()))
            .arg(format!("--shard={}", shard.shard_arg()))
            .current_dir(source_dir)
            .env("CI", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .context("Failed to spawn npx playwright test")?;

        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            warn!("Shard {} finished with exit code {}", shard.shard_arg(), exit_code);
        }

        Ok(ExecutionResult {
            artifact_path: pick_artifact(&blob_dir).await?,
            exit_code,
        })
    }
}

/// Prefer a single blob zip; otherwise the whole blob directory
async fn pick_artifact(blob_dir: &Path) -> Result<PathBuf> {
    let mut entries = fs::read_dir(blob_dir).await?;
    let mut zips = Vec::new();
    let mut any = false;

    while let Some(entry) = entries.next_entry().await? {
        any = true;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "zip") {
            zips.push(path);
        }
    }

    if !any {
        warn!("Blob report directory {} is empty", blob_dir.display());
    }

    zips.sort();
    Ok(match zips.as_slice() {
        [only] => only.clone(),
        _ => blob_dir.to_path_buf(),
    })
}

/// Merges blob reports with `npx playwright merge-reports`
#[derive(Debug, Clone, Default)]
pub struct PlaywrightMerger;

impl PlaywrightMerger {
    /// Copy every `.zip` below `partials_dir` into one flat directory
    async fn flatten_zips(partials_dir: &Path, all_blob_dir: &Path) -> Result<usize> {
        fs::create_dir_all(all_blob_dir).await?;

        let entries = collect_upload_entries(partials_dir).await?;
        let mut copied = 0;
        for entry in entries.iter().filter(|e| e.relative_key.ends_with(".zip")) {
            // shard directories keep equal file names apart
            let flat_name = entry.relative_key.replace('/', "__");
            fs::copy(&entry.path, all_blob_dir.join(flat_name))
                .await
                .with_context(|| format!("Failed to copy {}", entry.path.display()))?;
            copied += 1;
        }
        Ok(copied)
    }
}

#[async_trait]
impl ReportMerger for PlaywrightMerger {
    async fn merge(&self, partials_dir: &Path, output_dir: &Path) -> Result<MergedReport> {
        let all_blob_dir = output_dir.join("all-blob");
        let zips = Self::flatten_zips(partials_dir, &all_blob_dir).await?;
        info!("Found {} blob zip file(s)", zips);
        if zips == 0 {
            return Err(anyhow!(
                "No .zip files found under {}",
                partials_dir.display()
            ));
        }

        let all_blob = all_blob_dir.to_string_lossy();
        info!("Generating HTML report...");
        run_checked(
            "npx",
            &["playwright", "merge-reports", "--reporter", "html", &all_blob],
            Some(output_dir),
        )
        .await
        .context("Failed to merge HTML report")?;

        let html_dir = output_dir.join("playwright-report");
        if !fs::try_exists(&html_dir).await? {
            return Err(anyhow!("HTML output folder not found: {}", html_dir.display()));
        }

        info!("Generating JUnit report...");
        let junit = match run(
            "npx",
            &["playwright", "merge-reports", "--reporter", "junit", &all_blob],
            Some(output_dir),
            &[],
        )
        .await
        {
            Ok(output) if output.status.success() && !output.stdout.is_empty() => output.stdout,
            Ok(output) => {
                warn!("JUnit merge produced no output (status {})", output.status);
                EMPTY_JUNIT.as_bytes().to_vec()
            }
            Err(e) => {
                warn!("JUnit merge failed: {:#}", e);
                EMPTY_JUNIT.as_bytes().to_vec()
            }
        };

        let results_file = output_dir.join("results.xml");
        fs::write(&results_file, junit)
            .await
            .context("Failed to write results.xml")?;

        Ok(MergedReport {
            html_dir,
            results_file,
        })
    }
}
