use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::ProviderSettings;
use crate::error::ProviderError;
use crate::models::{Candidate, FetchedMessage, MessageId};

/// Remote mail source. Implementations only need to search and fetch.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Up to `limit` candidates for `query`, in the provider's relevance order.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>, ProviderError>;

    async fn fetch(&self, id: &MessageId) -> Result<FetchedMessage, ProviderError>;
}

#[async_trait]
impl<P: MailProvider + ?Sized> MailProvider for std::sync::Arc<P> {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>, ProviderError> {
        (**self).search(query, limit).await
    }

    async fn fetch(&self, id: &MessageId) -> Result<FetchedMessage, ProviderError> {
        (**self).fetch(id).await
    }
}

/// Timeout and retry rules for a single remote request. A provider whose
/// operations span several requests applies the policy to each of them,
/// so one slow page or one rate-limited lookup never restarts the whole
/// operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&ProviderSettings::default())
    }
}

impl From<&ProviderSettings> for RetryPolicy {
    fn from(settings: &ProviderSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
            call_timeout: settings.call_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Runs one request, built fresh by `op` for every attempt. Only
    /// retryable errors are retried; auth and malformed-response errors come
    /// back on the first attempt.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.call_timeout)),
            };
            match result {
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(%what, attempt, ?delay, error = %err, "retrying provider request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
