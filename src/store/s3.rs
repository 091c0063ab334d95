use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{BlobStore, join_key};

/// BlobStore implementation for S3 (and S3-compatible) buckets
///
/// Every key is stored below an optional root prefix, so several independent
/// deployments can share one bucket.
#[derive(Clone)]
pub struct S3BlobStore {
    s3_client: Arc<S3Client>,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    /// Create a new S3BlobStore
    pub fn new(s3_client: Arc<S3Client>, bucket: String, prefix: String) -> Self {
        Self {
            s3_client,
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        join_key(&[&self.prefix, key])
    }

    /// Strip the root prefix from a listed key
    fn relative_key(&self, full_key: &str) -> String {
        if self.prefix.is_empty() {
            return full_key.to_string();
        }
        full_key
            .strip_prefix(&self.prefix)
            .map(|rest| rest.trim_start_matches('/').to_string())
            .unwrap_or_else(|| full_key.to_string())
    }

    /// Listing prefix in bucket terms; keeps a trailing `/` from the caller
    fn full_prefix(&self, prefix: &str) -> String {
        if self.prefix.is_empty() {
            prefix.to_string()
        } else if prefix.is_empty() {
            format!("{}/", self.prefix)
        } else {
            format!("{}/{}", self.prefix, prefix.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.s3_client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .cache_control("no-store")
            .body(ByteStream::from(bytes))
            .send()
            .await
            .context("Failed to put S3 object")?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = match self
            .s3_client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok(None);
            }
            Err(e) => return Err(e).context("Failed to get S3 object"),
        };

        let bytes = response
            .body
            .collect()
            .await
            .context("Failed to collect S3 response body")?
            .into_bytes()
            .to_vec();

        Ok(Some(bytes))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .s3_client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(e).context("Failed to get S3 object metadata"),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_prefix(prefix);
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .s3_client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .context("Failed to list S3 objects")?;

            for object in response.contents() {
                if let Some(key) = object.key()
                    && !key.ends_with('/')
                {
                    keys.push(self.relative_key(key));
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.s3_client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .context("Failed to delete S3 object")?;
        Ok(())
    }

    fn describe(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.prefix)
        }
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        let presigning = PresigningConfig::expires_in(ttl).context("Invalid signed link lifetime")?;
        let request = self
            .s3_client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .presigned(presigning)
            .await
            .context("Failed to presign S3 object")?;
        Ok(Some(request.uri().to_string()))
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        self.s3_client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .cache_control("no-store")
            .body(body)
            .send()
            .await
            .context("Failed to upload file to S3")?;
        Ok(())
    }
}
