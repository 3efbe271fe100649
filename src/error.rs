use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::models::MessageId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} is already archived")]
    AlreadyExists(MessageId),
    #[error("message {0} is not archived")]
    NotFound(MessageId),
    #[error("invalid message id {0:?}")]
    InvalidId(String),
    #[error("invalid store key {0:?}")]
    InvalidKey(String),
    #[error("invalid sidecar name {0:?}")]
    InvalidSidecarName(String),
    #[error("timestamp {0} cannot be encoded in a store key")]
    InvalidTimestamp(String),
    #[error("corrupt record file {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive directory {} is unreachable: {source}", .path.display())]
    Unreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store operation {op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
}

impl StoreError {
    /// Fatal errors abort a whole run; everything else only affects one record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Unreachable { .. } | StoreError::Timeout { op: "scan", .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider authentication failed: {0}")]
    Auth(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout(_))
    }
}

/// Run-level failures. Per-id failures never surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("search failed: {0}")]
    Search(#[source] ProviderError),
    #[error("archive store failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("{} record(s) still pending, run backfill first: {}", .pending.len(), preview(.pending))]
    NotReady { pending: Vec<MessageId> },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn preview(ids: &[MessageId]) -> String {
    const SHOWN: usize = 5;
    let mut out = ids
        .iter()
        .take(SHOWN)
        .map(MessageId::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if ids.len() > SHOWN {
        out.push_str(&format!(" ... and {} more", ids.len() - SHOWN));
    }
    out
}
