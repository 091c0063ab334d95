use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use super::SourceFetcher;
use super::process::run_checked;

/// SourceFetcher that clones with `git` and installs npm dependencies
#[derive(Debug, Clone, Default)]
pub struct GitFetcher {
    /// Skip `npm ci` even when a `package.json` is present
    pub skip_install: bool,
}

impl GitFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, url: &str, git_ref: &str, dest: &Path) -> Result<PathBuf> {
        if fs::try_exists(dest).await? {
            info!("Removing existing checkout at {}", dest.display());
            fs::remove_dir_all(dest)
                .await
                .with_context(|| format!("Failed to remove {}", dest.display()))?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        info!("Cloning {} ({})", url, git_ref);
        let dest_str = dest.to_string_lossy();
        run_checked("git", &["clone", "--quiet", url, &dest_str], None)
            .await
            .context("git clone failed")?;
        run_checked("git", &["checkout", "--quiet", git_ref], Some(dest))
            .await
            .with_context(|| format!("git checkout {} failed", git_ref))?;

        if !self.skip_install && fs::try_exists(dest.join("package.json")).await? {
            info!("Installing dependencies in {}", dest.display());
            run_checked("npm", &["ci", "--no-audit", "--no-fund"], Some(dest))
                .await
                .context("npm ci failed")?;
        }

        info!("Checkout ready at {}", dest.display());
        Ok(dest.to_path_buf())
    }
}
