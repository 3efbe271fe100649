use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_gmail1::Gmail;
use google_gmail1::api::{Message, MessagePart};
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use tracing::debug;

use crate::error::ProviderError;
use crate::models::{AttachmentDescriptor, Candidate, FetchedMessage, Metadata, MessageId, Payload};
use crate::provider::{MailProvider, RetryPolicy};

const USER: &str = "me";
/// Gmail caps `messages.list` pages at 500.
const MAX_PAGE_SIZE: usize = 500;
const METADATA_HEADERS: [&str; 4] = ["Subject", "From", "To", "Date"];

/// Gmail backend. Every HTTP request gets its own timeout and retries from
/// `policy`; a search is one list request per page plus one lookup per id.
#[derive(Clone)]
pub struct GmailProvider {
    hub: Gmail<HttpsConnector<HttpConnector>>,
    policy: RetryPolicy,
}

impl GmailProvider {
    pub fn new(hub: Gmail<HttpsConnector<HttpConnector>>, policy: RetryPolicy) -> Self {
        Self { hub, policy }
    }

    async fn list_ids(&self, query: &str, limit: usize) -> Result<Vec<String>, ProviderError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        while ids.len() < limit {
            let page_size = (limit - ids.len()).min(MAX_PAGE_SIZE) as u32;
            let (_, list) = self
                .policy
                .run("messages.list", || {
                    let mut req = self
                        .hub
                        .users()
                        .messages_list(USER)
                        .q(query)
                        .max_results(page_size);
                    if let Some(token) = &page_token {
                        req = req.page_token(token);
                    }
                    async move { req.doit().await.map_err(classify) }
                })
                .await?;

            ids.extend(
                list.messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| m.id),
            );
            page_token = list.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        ids.truncate(limit);
        Ok(ids)
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>, ProviderError> {
        let ids = self.list_ids(query, limit).await?;
        debug!(query, found = ids.len(), "gmail search");

        let mut candidates = Vec::with_capacity(ids.len());
        for id in ids {
            let (_, msg) = self
                .policy
                .run("messages.get", || {
                    let mut req = self
                        .hub
                        .users()
                        .messages_get(USER, &id)
                        .format("metadata");
                    for header in METADATA_HEADERS {
                        req = req.add_metadata_headers(header);
                    }
                    async move { req.doit().await.map_err(classify) }
                })
                .await?;
            candidates.push(Candidate::from(metadata_of(&msg)?));
        }
        Ok(candidates)
    }

    async fn fetch(&self, id: &MessageId) -> Result<FetchedMessage, ProviderError> {
        let (_, msg) = self
            .policy
            .run("messages.get", || {
                let req = self
                    .hub
                    .users()
                    .messages_get(USER, id.as_str())
                    .format("full");
                async move { req.doit().await.map_err(classify) }
            })
            .await?;

        let metadata = metadata_of(&msg)?;
        let mut payload = Payload {
            snippet: msg.snippet.clone(),
            ..Payload::default()
        };
        if let Some(part) = &msg.payload {
            payload.body_text = collect_body(part, "text/plain").unwrap_or_default();
            payload.body_html = collect_body(part, "text/html");
            collect_attachments(part, &mut payload.attachments);
        }
        Ok(FetchedMessage { metadata, payload })
    }
}

fn metadata_of(msg: &Message) -> Result<Metadata, ProviderError> {
    let raw_id = msg
        .id
        .clone()
        .ok_or_else(|| ProviderError::Malformed("message without id".into()))?;
    let id = MessageId::new(raw_id).map_err(|e| ProviderError::Malformed(e.to_string()))?;
    let timestamp = msg
        .internal_date
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| ProviderError::Malformed(format!("message {id} has no internalDate")))?;

    let mut metadata = Metadata::new(id, timestamp);
    metadata.thread_id = msg.thread_id.clone();
    metadata.labels = msg.label_ids.clone().unwrap_or_default();
    if let Some(headers) = msg.payload.as_ref().and_then(|p| p.headers.as_ref()) {
        for header in headers {
            let value = header.value.clone();
            match header.name.as_deref().map(str::to_ascii_lowercase).as_deref() {
                Some("from") => metadata.from = value,
                Some("to") => metadata.to = value,
                Some("subject") => metadata.subject = value,
                Some("date") => metadata.date = value,
                _ => {}
            }
        }
    }
    Ok(metadata)
}

/// Concatenates every part of `mime_type` in document order.
fn collect_body(part: &MessagePart, mime_type: &str) -> Option<String> {
    if part.mime_type.as_deref() == Some(mime_type) && part.filename.as_deref().unwrap_or("").is_empty() {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref()) {
            return Some(decode_body(data));
        }
    }

    let mut full_body = String::new();
    for child in part.parts.iter().flatten() {
        if let Some(body) = collect_body(child, mime_type) {
            full_body.push_str(&body);
        }
    }
    (!full_body.is_empty()).then_some(full_body)
}

/// The API client already base64url-decodes `data`; some proxies hand back
/// the still-encoded text, so that is tried as a fallback.
fn decode_body(data: &[u8]) -> String {
    use base64::{Engine as _, engine::general_purpose};

    if let Ok(text) = std::str::from_utf8(data) {
        let trimmed = text.trim();
        let looks_encoded = !trimmed.is_empty()
            && trimmed
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'='));
        if looks_encoded {
            let decoded = general_purpose::URL_SAFE_NO_PAD
                .decode(trimmed.trim_end_matches('='))
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            if let Some(decoded) = decoded {
                return decoded;
            }
        }
        return text.to_string();
    }
    String::from_utf8_lossy(data).into_owned()
}

fn collect_attachments(part: &MessagePart, out: &mut Vec<AttachmentDescriptor>) {
    if let Some(filename) = part.filename.as_deref().filter(|f| !f.is_empty()) {
        let body = part.body.as_ref();
        out.push(AttachmentDescriptor {
            filename: filename.to_string(),
            mime_type: part.mime_type.clone(),
            size: body.and_then(|b| b.size).and_then(|s| u64::try_from(s).ok()),
            attachment_id: body.and_then(|b| b.attachment_id.clone()),
        });
    }
    for child in part.parts.iter().flatten() {
        collect_attachments(child, out);
    }
}

fn classify(err: google_gmail1::Error) -> ProviderError {
    use google_gmail1::Error;

    match err {
        Error::HttpError(e) => ProviderError::Transient(e.to_string()),
        Error::Io(e) => ProviderError::Transient(e.to_string()),
        Error::MissingToken(e) => ProviderError::Auth(e.to_string()),
        Error::MissingAPIKey => ProviderError::Auth("missing API key".into()),
        Error::JsonDecodeError(body, e) => ProviderError::Malformed(format!("{e}: {body}")),
        Error::BadRequest(value) => ProviderError::Rejected(value.to_string()),
        Error::Failure(response) => {
            let status = response.status();
            let message = format!("HTTP {status}");
            if status.as_u16() == 401 || status.as_u16() == 403 {
                ProviderError::Auth(message)
            } else if status.as_u16() == 429 || status.is_server_error() {
                ProviderError::Transient(message)
            } else {
                ProviderError::Rejected(message)
            }
        }
        other => ProviderError::Rejected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::{MessagePartBody, MessagePartHeader};

    fn text_part(mime: &str, data: &str) -> MessagePart {
        MessagePart {
            mime_type: Some(mime.into()),
            body: Some(MessagePartBody {
                data: Some(data.as_bytes().to_vec()),
                ..MessagePartBody::default()
            }),
            ..MessagePart::default()
        }
    }

    #[test]
    fn multipart_bodies_and_attachments_are_collected() {
        let attachment = MessagePart {
            mime_type: Some("application/pdf".into()),
            filename: Some("invoice.pdf".into()),
            body: Some(MessagePartBody {
                attachment_id: Some("att-1".into()),
                size: Some(2048),
                ..MessagePartBody::default()
            }),
            ..MessagePart::default()
        };
        let root = MessagePart {
            mime_type: Some("multipart/mixed".into()),
            parts: Some(vec![
                text_part("text/plain", "Hello "),
                text_part("text/html", "<p>Hello</p>"),
                text_part("text/plain", "world"),
                attachment,
            ]),
            ..MessagePart::default()
        };

        assert_eq!(collect_body(&root, "text/plain").as_deref(), Some("Hello world"));
        assert_eq!(collect_body(&root, "text/html").as_deref(), Some("<p>Hello</p>"));

        let mut attachments = Vec::new();
        collect_attachments(&root, &mut attachments);
        assert_eq!(
            attachments,
            vec![AttachmentDescriptor {
                filename: "invoice.pdf".into(),
                mime_type: Some("application/pdf".into()),
                size: Some(2048),
                attachment_id: Some("att-1".into()),
            }]
        );
    }

    #[test]
    fn metadata_uses_internal_date_and_headers() {
        let msg = Message {
            id: Some("18c2f".into()),
            thread_id: Some("t1".into()),
            internal_date: Some(1_768_212_000_000),
            label_ids: Some(vec!["INBOX".into()]),
            payload: Some(MessagePart {
                headers: Some(vec![
                    MessagePartHeader {
                        name: Some("Subject".into()),
                        value: Some("Status".into()),
                    },
                    MessagePartHeader {
                        name: Some("from".into()),
                        value: Some("ann@example.com".into()),
                    },
                ]),
                ..MessagePart::default()
            }),
            ..Message::default()
        };

        let metadata = metadata_of(&msg).unwrap();
        assert_eq!(metadata.id.as_str(), "18c2f");
        assert_eq!(metadata.timestamp.timestamp_millis(), 1_768_212_000_000);
        assert_eq!(metadata.subject.as_deref(), Some("Status"));
        assert_eq!(metadata.from.as_deref(), Some("ann@example.com"));
        assert_eq!(metadata.labels, vec!["INBOX".to_string()]);
    }

    #[test]
    fn messages_without_id_or_date_are_malformed() {
        let no_date = Message {
            id: Some("x".into()),
            ..Message::default()
        };
        assert!(matches!(metadata_of(&no_date), Err(ProviderError::Malformed(_))));
        assert!(matches!(
            metadata_of(&Message::default()),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn encoded_body_text_is_decoded_once() {
        assert_eq!(decode_body(b"SGVsbG8"), "Hello");
        assert_eq!(decode_body(b"plain text, already decoded"), "plain text, already decoded");
    }
}
