//! Incremental sync: archive the remote candidates for a query that the
//! store does not know yet.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{StoreError, SyncError};
use crate::models::{Candidate, MessageId};
use crate::provider::MailProvider;
use crate::store::EmailStore;

/// Counts reported after a run. `new` only counts fully archived records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub total: usize,
    pub existing: usize,
    pub new: usize,
    pub failed: Vec<MessageId>,
    /// Ids left untouched because the run was cancelled.
    pub skipped: Vec<MessageId>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn summary_line(&self) -> String {
        format!(
            "Found {} messages. New: {} (existing: {}, failed: {})",
            self.total,
            self.new,
            self.existing,
            self.failed.len()
        )
    }
}

enum Outcome {
    Archived,
    /// Another writer created the record first.
    AlreadyHandled,
    Failed(MessageId),
    Skipped(MessageId),
}

pub struct SyncCoordinator<P> {
    store: EmailStore,
    provider: P,
    workers: usize,
    cancel: CancelToken,
}

impl<P: MailProvider> SyncCoordinator<P> {
    pub fn new(store: EmailStore, provider: P) -> Self {
        Self {
            store,
            provider,
            workers: 1,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Archives at most `limit` candidates for `query`. Per-id failures are
    /// logged and reported; only search failures and fatal store errors
    /// abort the run.
    pub async fn run(&self, query: &str, limit: usize) -> Result<SyncReport, SyncError> {
        let known = self.store.known_ids().await?;
        let mut candidates = self
            .provider
            .search(query, limit)
            .await
            .map_err(SyncError::Search)?;
        candidates.truncate(limit);

        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(c.id().clone()));

        let total = candidates.len();
        let (existing, fresh): (Vec<Candidate>, Vec<Candidate>) =
            candidates.into_iter().partition(|c| known.contains(c.id()));
        info!(query, total, existing = existing.len(), new = fresh.len(), "sync candidates");

        let mut report = SyncReport {
            total,
            existing: existing.len(),
            ..SyncReport::default()
        };

        let mut outcomes = stream::iter(fresh)
            .map(|candidate| self.archive_one(candidate))
            .buffer_unordered(self.workers);
        while let Some(outcome) = outcomes.next().await {
            match outcome? {
                Outcome::Archived => report.new += 1,
                Outcome::AlreadyHandled => report.existing += 1,
                Outcome::Failed(id) => report.failed.push(id),
                Outcome::Skipped(id) => report.skipped.push(id),
            }
        }
        report.cancelled = !report.skipped.is_empty();

        info!(
            new = report.new,
            existing = report.existing,
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "sync finished"
        );
        Ok(report)
    }

    async fn archive_one(&self, candidate: Candidate) -> Result<Outcome, StoreError> {
        let id = candidate.id().clone();
        if self.cancel.is_cancelled() {
            return Ok(Outcome::Skipped(id));
        }

        let fetched = match self.provider.fetch(&id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(%id, error = %err, "fetch failed, skipping");
                return Ok(Outcome::Failed(id));
            }
        };
        if fetched.metadata.id != id {
            warn!(%id, returned = %fetched.metadata.id, "provider returned a different message, skipping");
            return Ok(Outcome::Failed(id));
        }

        match self.store.create(fetched.metadata).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists(_)) => {
                debug!(%id, "already archived by another run");
                return Ok(Outcome::AlreadyHandled);
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(%id, error = %err, "could not create record");
                return Ok(Outcome::Failed(id));
            }
        }

        match self.store.populate_content(&id, &fetched.payload, false).await {
            Ok(_) => {
                debug!(%id, "archived");
                Ok(Outcome::Archived)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(%id, error = %err, "record left pending");
                Ok(Outcome::Failed(id))
            }
        }
    }
}
