//! Error taxonomy for the coordination layer
//!
//! Backends and external collaborators report `anyhow::Error` with context;
//! the coordination components classify those into the variants below so
//! callers can tell a fatal configuration problem from a wait that never
//! completed or a store hiccup that is worth retrying.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Required identity or location input is missing or invalid. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The blob store failed persistently for the named operation.
    #[error("store operation `{operation}` failed: {cause:#}")]
    Infra {
        operation: String,
        cause: anyhow::Error,
    },

    /// A wait condition was not reached before its deadline.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    /// Uploading one object of a partial or final artifact failed.
    #[error("upload of `{key}` failed: {cause:#}")]
    Upload { key: String, cause: anyhow::Error },

    /// An external collaborator (fetcher, executor, merger) failed to run.
    #[error("{name} failed: {cause:#}")]
    Collaborator {
        name: &'static str,
        cause: anyhow::Error,
    },
}

impl CoordinationError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn infra(operation: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Infra {
            operation: operation.into(),
            cause,
        }
    }

    pub fn timeout(what: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            waited,
        }
    }

    /// Transient store failures may be retried; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Infra { .. } | Self::Upload { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;
