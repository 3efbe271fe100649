use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

const KEY_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const KEY_STAMP_LEN: usize = 15;

/// Provider-assigned message id.
///
/// Restricted to ASCII alphanumerics, `-` and `_` so it can be embedded in a
/// file name without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
    pub fn new(raw: impl Into<String>) -> Result<Self, StoreError> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw))
        } else {
            Err(StoreError::InvalidId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MessageId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for MessageId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

/// Header-like fields of an archived message. Always present once a record
/// exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    /// Raw `Date:` header as sent, kept alongside the normalized timestamp.
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Metadata {
    pub fn new(id: MessageId, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            timestamp,
            thread_id: None,
            from: None,
            to: None,
            subject: None,
            date: None,
            labels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    /// Provider handle for downloading the attachment bytes later.
    #[serde(default)]
    pub attachment_id: Option<String>,
}

/// Heavyweight content of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "payload", rename_all = "snake_case")]
pub enum ContentState {
    Pending,
    Populated(Payload),
}

impl ContentState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ContentState::Pending)
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            ContentState::Populated(payload) => Some(payload),
            ContentState::Pending => None,
        }
    }
}

/// Content state without the payload, for cheap state checks and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Pending,
    Populated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: StoreKey,
    pub metadata: Metadata,
    /// `None` when content was not requested.
    pub content: Option<ContentState>,
}

/// Remote search hit, not yet promoted into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub metadata: Metadata,
}

impl Candidate {
    pub fn id(&self) -> &MessageId {
        &self.metadata.id
    }
}

impl From<Metadata> for Candidate {
    fn from(metadata: Metadata) -> Self {
        Self { metadata }
    }
}

/// Full message as returned by a provider fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub metadata: Metadata,
    pub payload: Payload,
}

/// Sortable persistence key: `YYYYmmdd-HHMMSS_<id>`.
///
/// The stamp is fixed width, so comparing key text is the same as comparing
/// `(timestamp, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey {
    stamp: NaiveDateTime,
    id: MessageId,
}

impl StoreKey {
    pub fn new(timestamp: DateTime<Utc>, id: MessageId) -> Result<Self, StoreError> {
        let year = timestamp.year();
        if !(0..=9999).contains(&year) {
            return Err(StoreError::InvalidTimestamp(timestamp.to_rfc3339()));
        }
        let stamp = timestamp
            .naive_utc()
            .with_nanosecond(0)
            .ok_or_else(|| StoreError::InvalidTimestamp(timestamp.to_rfc3339()))?;
        Ok(Self { stamp, id })
    }

    pub fn for_metadata(metadata: &Metadata) -> Result<Self, StoreError> {
        Self::new(metadata.timestamp, metadata.id.clone())
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Key timestamp, truncated to whole seconds.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.stamp.and_utc()
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.stamp.format(KEY_STAMP_FORMAT), self.id)
    }
}

impl FromStr for StoreKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || StoreError::InvalidKey(s.to_string());
        if s.len() <= KEY_STAMP_LEN + 1 || !s.is_char_boundary(KEY_STAMP_LEN) {
            return Err(malformed());
        }
        let (stamp, rest) = s.split_at(KEY_STAMP_LEN);
        let id = rest.strip_prefix('_').ok_or_else(malformed)?;
        let stamp =
            NaiveDateTime::parse_from_str(stamp, KEY_STAMP_FORMAT).map_err(|_| malformed())?;
        let id = MessageId::new(id).map_err(|_| malformed())?;
        Ok(Self { stamp, id })
    }
}
