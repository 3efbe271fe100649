//! Populates content for records whose metadata is already archived.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::StoreError;
use crate::models::{MessageId, StateKind};
use crate::provider::MailProvider;
use crate::store::{EmailStore, ListQuery, PopulateOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub planned: Vec<MessageId>,
    pub populated: usize,
    pub already_populated: usize,
    pub failed: Vec<MessageId>,
    pub skipped: Vec<MessageId>,
    pub dry_run: bool,
}

impl BackfillReport {
    pub fn remaining(&self) -> usize {
        self.planned.len() - self.populated - self.already_populated
    }
}

enum Step {
    Populated,
    AlreadyPopulated,
    Failed(MessageId),
    Skipped(MessageId),
}

/// Pending ids in key order, truncated to `bound`.
pub async fn pending_ids(store: &EmailStore, bound: Option<usize>) -> Result<Vec<MessageId>, StoreError> {
    let keys = store
        .list_keys(&ListQuery {
            state: Some(StateKind::Pending),
            limit: bound,
            ..ListQuery::default()
        })
        .await?;
    Ok(keys.into_iter().map(|key| key.id().clone()).collect())
}

pub struct Backfill<P> {
    store: EmailStore,
    provider: P,
    workers: usize,
    cancel: CancelToken,
}

impl<P: MailProvider> Backfill<P> {
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

    pub async fn plan(&self, bound: Option<usize>) -> Result<Vec<MessageId>, StoreError> {
        pending_ids(&self.store, bound).await
    }

    pub async fn run(&self, bound: Option<usize>, dry_run: bool) -> Result<BackfillReport, StoreError> {
        let planned = self.plan(bound).await?;
        info!(planned = planned.len(), dry_run, "backfill plan");
        let mut report = BackfillReport {
            planned: planned.clone(),
            dry_run,
            ..BackfillReport::default()
        };
        if dry_run {
            return Ok(report);
        }

        let mut steps = stream::iter(planned)
            .map(|id| self.fill_one(id))
            .buffer_unordered(self.workers);
        while let Some(step) = steps.next().await {
            match step? {
                Step::Populated => report.populated += 1,
                Step::AlreadyPopulated => report.already_populated += 1,
                Step::Failed(id) => report.failed.push(id),
                Step::Skipped(id) => report.skipped.push(id),
            }
        }

        info!(
            populated = report.populated,
            failed = report.failed.len(),
            remaining = report.remaining(),
            "backfill finished"
        );
        Ok(report)
    }

    async fn fill_one(&self, id: MessageId) -> Result<Step, StoreError> {
        if self.cancel.is_cancelled() {
            return Ok(Step::Skipped(id));
        }
        // A stale plan may name records filled since; those are never re-fetched.
        match self.store.content_state_of(&id).await {
            Ok(StateKind::Populated) => return Ok(Step::AlreadyPopulated),
            Ok(StateKind::Pending) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(%id, error = %err, "cannot read record state");
                return Ok(Step::Failed(id));
            }
        }

        let fetched = match self.provider.fetch(&id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(%id, error = %err, "fetch failed, skipping");
                return Ok(Step::Failed(id));
            }
        };

        match self.store.populate_content(&id, &fetched.payload, false).await {
            Ok(PopulateOutcome::AlreadyPopulated) => Ok(Step::AlreadyPopulated),
            Ok(_) => {
                debug!(%id, "populated");
                Ok(Step::Populated)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(%id, error = %err, "could not store content");
                Ok(Step::Failed(id))
            }
        }
    }
}
