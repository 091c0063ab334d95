//! Distributed once-barrier: one writer announces a value, everyone else waits for it
//!
//! The barrier is a single well-known object. Worker 0 writes it with one
//! atomic put (`announce`); followers poll it until it is present
//! (`await_announcement`). No contention is possible because only one worker
//! ever writes, and no torn value is ever read because the store guarantees
//! whole-object visibility.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::store::{BlobStore, RetryPolicy, retry};

/// Outcome of a single poll of the marker object
enum Poll<T> {
    Ready(T),
    Absent,
    Rejected(String),
    StoreFailed(anyhow::Error),
}

pub struct OnceBarrier {
    store: Arc<dyn BlobStore>,
    key: String,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl OnceBarrier {
    pub fn new(
        store: Arc<dyn BlobStore>,
        key: impl Into<String>,
        poll_interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            poll_interval,
            retry,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the value with a single whole-object write
    pub async fn announce<T: Serialize>(&self, value: &T) -> CoordinationResult<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| CoordinationError::infra(format!("serialize {}", self.key), e.into()))?;

        retry(&format!("announce {}", self.key), self.retry, || {
            self.store.put(&self.key, bytes.clone())
        })
        .await
        .map_err(|e| CoordinationError::infra(format!("announce {}", self.key), e))?;

        debug!("Announced {}", self.key);
        Ok(())
    }

    /// Wait until the value has been announced
    pub async fn await_announcement<T: DeserializeOwned>(
        &self,
        timeout: Duration,
    ) -> CoordinationResult<T> {
        self.await_matching(timeout, |_: &T| Ok(())).await
    }

    /// Wait until an announced value passes `accept`
    ///
    /// A rejected value is treated like an absent one, which lets callers skip
    /// markers left behind by another invocation.
    pub async fn await_matching<T, F>(&self, timeout: Duration, accept: F) -> CoordinationResult<T>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> Result<(), String>,
    {
        let start = Instant::now();

        loop {
            let last_store_error = match self.poll(&accept).await {
                Poll::Ready(value) => return Ok(value),
                Poll::Absent => None,
                Poll::Rejected(reason) => {
                    warn!("Ignoring marker {}: {}", self.key, reason);
                    None
                }
                Poll::StoreFailed(e) => {
                    warn!("Failed to read marker {}: {:#}", self.key, e);
                    Some(e)
                }
            };

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(match last_store_error {
                    Some(e) => CoordinationError::infra(format!("read {}", self.key), e),
                    None => CoordinationError::timeout(
                        format!("marker {} on {}", self.key, self.store.describe()),
                        elapsed,
                    ),
                });
            }

            tokio::time::sleep(self.poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Best-effort removal of the marker
    pub async fn clear(&self) -> anyhow::Result<()> {
        self.store.delete(&self.key).await
    }

    async fn poll<T, F>(&self, accept: &F) -> Poll<T>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> Result<(), String>,
    {
        match self.store.get(&self.key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => match accept(&value) {
                    Ok(()) => Poll::Ready(value),
                    Err(reason) => Poll::Rejected(reason),
                },
                Err(e) => Poll::Rejected(format!("unparseable contents: {}", e)),
            },
            Ok(None) => Poll::Absent,
            Err(e) => Poll::StoreFailed(e),
        }
    }
}
