//! Reconciles an externally supplied candidate list into the store as
//! pending records.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::models::{Candidate, MessageId};
use crate::store::EmailStore;

const DRIFT_LOG_LIMIT: usize = 5;

/// An archived id that the authoritative candidate list no longer contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftWarning {
    pub id: MessageId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub created: Vec<MessageId>,
    pub unchanged: usize,
    /// Repeated ids inside the candidate list itself.
    pub duplicates: usize,
    pub failed: Vec<MessageId>,
    pub drift: Vec<DriftWarning>,
}

pub struct CandidateMerge {
    store: EmailStore,
}

impl CandidateMerge {
    pub fn new(store: EmailStore) -> Self {
        Self { store }
    }

    /// Creates a pending record for every unknown candidate. Known records
    /// are left exactly as they are; nothing is ever deleted.
    pub async fn merge(&self, candidates: &[Candidate]) -> Result<MergeReport, StoreError> {
        let known = self.store.known_ids().await?;
        let listed: HashSet<&MessageId> = candidates.iter().map(Candidate::id).collect();

        let mut drift: Vec<DriftWarning> = known
            .iter()
            .filter(|id| !listed.contains(id))
            .map(|id| DriftWarning { id: id.clone() })
            .collect();
        drift.sort_by(|a, b| a.id.cmp(&b.id));
        if !drift.is_empty() {
            let sample: Vec<&str> = drift
                .iter()
                .take(DRIFT_LOG_LIMIT)
                .map(|d| d.id.as_str())
                .collect();
            warn!(
                count = drift.len(),
                sample = ?sample,
                "archived messages missing from candidate list; remote may have changed"
            );
        }

        let mut report = MergeReport {
            drift,
            ..MergeReport::default()
        };
        let mut seen = HashSet::new();
        for candidate in candidates {
            let id = candidate.id();
            if !seen.insert(id) {
                report.duplicates += 1;
                continue;
            }
            if known.contains(id) {
                report.unchanged += 1;
                continue;
            }
            match self.store.create(candidate.metadata.clone()).await {
                Ok(_) => report.created.push(id.clone()),
                Err(StoreError::AlreadyExists(_)) => report.unchanged += 1,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(%id, error = %err, "could not merge candidate");
                    report.failed.push(id.clone());
                }
            }
        }

        info!(
            created = report.created.len(),
            unchanged = report.unchanged,
            drift = report.drift.len(),
            "merge finished"
        );
        Ok(report)
    }
}
