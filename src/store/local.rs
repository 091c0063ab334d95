use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use super::BlobStore;

/// Marker embedded in temp file names so listings can skip in-flight writes
const TEMP_MARKER: &str = ".tmp-";

/// Local filesystem implementation of BlobStore
///
/// Keys map to paths below `root`. Writes go to a hidden temp sibling which is
/// then renamed into place, so readers never observe a partially written file.
/// Directory structure:
///   {root}/{key}
///   {root}/{key dir}/.{file name}.tmp-{uuid}   (in-flight, never listed)
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Create a new LocalBlobStore rooted at the given directory
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the path backing a key
    fn object_path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    fn is_temp_file(name: &str) -> bool {
        name.starts_with('.') && name.contains(TEMP_MARKER)
    }

    /// Convert a path below root back into a `/`-separated key
    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(segments.join("/"))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.object_path(key);
        let parent = path
            .parent()
            .with_context(|| format!("Invalid object key: {}", key))?;
        let file_name = path
            .file_name()
            .with_context(|| format!("Invalid object key: {}", key))?
            .to_string_lossy()
            .into_owned();

        fs::create_dir_all(parent)
            .await
            .context("Failed to create object directory")?;

        let temp_path = parent.join(format!(".{}{}{}", file_name, TEMP_MARKER, Uuid::new_v4()));
        fs::write(&temp_path, bytes)
            .await
            .context("Failed to write temporary object file")?;

        // rename within one directory is atomic
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e).context("Failed to move object into place");
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.object_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read object file"),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key);
        let exists = fs::try_exists(&path)
            .await
            .context("Failed to check object existence")?;
        Ok(exists && path.is_file())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        if !fs::try_exists(&self.root)
            .await
            .context("Failed to check store root")?
        {
            return Ok(keys);
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // directory removed by a concurrent delete
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).context("Failed to read store directory"),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .context("Failed to read store directory entry")?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .context("Failed to read store entry type")?;

                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                if Self::is_temp_file(&entry.file_name().to_string_lossy()) {
                    continue;
                }

                if let Some(key) = self.key_for(&path)
                    && key.starts_with(prefix)
                {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to delete object file"),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}
