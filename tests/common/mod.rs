#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use gmex::cancel::CancelToken;
use gmex::error::ProviderError;
use gmex::models::{Candidate, FetchedMessage, Metadata, MessageId, Payload};
use gmex::provider::MailProvider;
use gmex::store::{EmailStore, StoreConfig};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

pub fn id(raw: &str) -> MessageId {
    MessageId::new(raw).expect("valid id")
}

/// Message `raw` received on 2026-01-`day`.
pub fn message(raw: &str, day: u32) -> FetchedMessage {
    let mut metadata = Metadata::new(id(raw), Utc.with_ymd_and_hms(2026, 1, day, 9, 30, 0).unwrap());
    metadata.subject = Some(format!("Subject {raw}"));
    metadata.from = Some(format!("{raw}@example.com"));
    metadata.thread_id = Some(format!("thread-{raw}"));
    FetchedMessage {
        metadata,
        payload: Payload {
            snippet: Some(format!("snippet {raw}")),
            body_text: format!("Body of {raw}"),
            ..Payload::default()
        },
    }
}

/// Five messages A..E, newest first, as a mailbox search returns them.
pub fn mailbox() -> Vec<FetchedMessage> {
    vec![
        message("A", 5),
        message("B", 4),
        message("C", 3),
        message("D", 2),
        message("E", 1),
    ]
}

pub async fn open_store(dir: &Path) -> EmailStore {
    EmailStore::open(StoreConfig::new(dir)).await.expect("open store")
}

/// In-memory mailbox with scriptable fetch failures.
pub struct FakeProvider {
    messages: Vec<FetchedMessage>,
    failing: Mutex<HashSet<MessageId>>,
    fetched: Mutex<Vec<MessageId>>,
    cancel_after: Option<(usize, CancelToken)>,
}

impl FakeProvider {
    pub fn new(messages: Vec<FetchedMessage>) -> Self {
        Self {
            messages,
            failing: Mutex::new(HashSet::new()),
            fetched: Mutex::new(Vec::new()),
            cancel_after: None,
        }
    }

    /// Trips `cancel` once `fetches` fetches have completed.
    pub fn cancelling_after(mut self, fetches: usize, cancel: CancelToken) -> Self {
        self.cancel_after = Some((fetches, cancel));
        self
    }

    pub fn fail(&self, raw: &str) {
        self.failing.lock().unwrap().insert(id(raw));
    }

    pub fn heal(&self, raw: &str) {
        self.failing.lock().unwrap().remove(&id(raw));
    }

    pub fn fetched(&self) -> Vec<MessageId> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn candidates(&self, limit: usize) -> Vec<Candidate> {
        self.messages
            .iter()
            .take(limit)
            .map(|m| Candidate::from(m.metadata.clone()))
            .collect()
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<Candidate>, ProviderError> {
        Ok(self.candidates(limit))
    }

    async fn fetch(&self, id: &MessageId) -> Result<FetchedMessage, ProviderError> {
        if self.failing.lock().unwrap().contains(id) {
            return Err(ProviderError::Transient(format!("{id} unavailable")));
        }
        let message = self
            .messages
            .iter()
            .find(|m| &m.metadata.id == id)
            .cloned()
            .ok_or_else(|| ProviderError::Rejected(format!("{id} not in mailbox")))?;
        let count = {
            let mut fetched = self.fetched.lock().unwrap();
            fetched.push(id.clone());
            fetched.len()
        };
        if let Some((after, cancel)) = &self.cancel_after {
            if count >= *after {
                cancel.cancel();
            }
        }
        Ok(message)
    }
}

/// Search always fails; for exercising run-level errors.
pub struct BrokenSearch;

#[async_trait]
impl MailProvider for BrokenSearch {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<Candidate>, ProviderError> {
        Err(ProviderError::Auth("token revoked".into()))
    }

    async fn fetch(&self, id: &MessageId) -> Result<FetchedMessage, ProviderError> {
        Err(ProviderError::Rejected(id.to_string()))
    }
}
