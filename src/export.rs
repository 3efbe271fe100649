//! Read-only export of fully populated records.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::ExportError;
use crate::models::{ContentState, Metadata, MessageId, Payload};
use crate::store::{EmailStore, ListQuery};

const RULE: &str =
    "================================================================================";
const THIN_RULE: &str =
    "--------------------------------------------------------------------------------";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedMessage {
    pub metadata: Metadata,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub count: usize,
    pub html_path: PathBuf,
    pub txt_path: PathBuf,
}

pub struct Exporter {
    store: EmailStore,
}

impl Exporter {
    pub fn new(store: EmailStore) -> Self {
        Self { store }
    }

    /// Loads every record in scope. Fails with `NotReady` naming all pending
    /// ids if any record still lacks content.
    pub async fn collect(&self, query: &ListQuery) -> Result<Vec<ExportedMessage>, ExportError> {
        let keys = self.store.list_keys(query).await?;
        let mut ready = Vec::with_capacity(keys.len());
        let mut pending: Vec<MessageId> = Vec::new();
        for key in keys {
            let record = self.store.get(key.id(), true).await?;
            match record.content {
                Some(ContentState::Populated(payload)) => ready.push(ExportedMessage {
                    metadata: record.metadata,
                    payload,
                }),
                _ => pending.push(record.metadata.id),
            }
        }
        if !pending.is_empty() {
            return Err(ExportError::NotReady { pending });
        }
        Ok(ready)
    }

    /// Writes `<base>-export.html` and `<base>-export.txt`.
    pub async fn write_files(&self, query: &ListQuery, base: &Path) -> Result<ExportSummary, ExportError> {
        let messages = self.collect(query).await?;
        let html_path = suffixed(base, "-export.html");
        let txt_path = suffixed(base, "-export.txt");

        for (path, content) in [
            (&html_path, render_html(&messages)),
            (&txt_path, render_text(&messages)),
        ] {
            tokio::fs::write(path, content)
                .await
                .map_err(|source| ExportError::Write {
                    path: path.clone(),
                    source,
                })?;
        }
        info!(count = messages.len(), html = %html_path.display(), txt = %txt_path.display(), "export written");
        Ok(ExportSummary {
            count: messages.len(),
            html_path,
            txt_path,
        })
    }
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn display_date(metadata: &Metadata) -> String {
    metadata
        .date
        .clone()
        .unwrap_or_else(|| metadata.timestamp.to_rfc2822())
}

fn subject_or_default(metadata: &Metadata) -> &str {
    match metadata.subject.as_deref() {
        Some(subject) if !subject.is_empty() => subject,
        _ => "(No Subject)",
    }
}

pub fn render_text(messages: &[ExportedMessage]) -> String {
    let mut out = format!("EMAIL EXPORT ({} messages)\n{RULE}\n\n", messages.len());
    for (i, message) in messages.iter().enumerate() {
        let meta = &message.metadata;
        out.push_str(&format!(
            "[{}] {}\n{THIN_RULE}\nFrom: {}\nTo: {}\nDate: {}\n\n{}\n\n{RULE}\n\n",
            i + 1,
            subject_or_default(meta),
            meta.from.as_deref().unwrap_or_default(),
            meta.to.as_deref().unwrap_or_default(),
            display_date(meta),
            message.payload.body_text,
        ));
    }
    out
}

pub fn render_html(messages: &[ExportedMessage]) -> String {
    let mut out = String::from(concat!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n",
        "<title>Email Export</title>\n<style>\n",
        "body { font-family: -apple-system, sans-serif; max-width: 900px; margin: 0 auto; padding: 20px; background: #f5f5f5; }\n",
        ".email { background: white; border-radius: 8px; padding: 20px; margin-bottom: 20px; }\n",
        ".email-meta { color: #666; font-size: 14px; margin: 4px 0; }\n",
        ".email-body { white-space: pre-wrap; line-height: 1.6; }\n",
        ".email-index { color: #999; font-size: 12px; float: right; }\n",
        "</style>\n</head>\n<body>\n",
    ));
    out.push_str(&format!("<h1>Email Export ({} messages)</h1>\n", messages.len()));
    for (i, message) in messages.iter().enumerate() {
        let meta = &message.metadata;
        out.push_str(&format!(
            concat!(
                "<div class=\"email\">\n",
                "<span class=\"email-index\">#{}</span>\n",
                "<h2>{}</h2>\n",
                "<p class=\"email-meta\"><strong>From:</strong> {}</p>\n",
                "<p class=\"email-meta\"><strong>To:</strong> {}</p>\n",
                "<p class=\"email-meta\"><strong>Date:</strong> {}</p>\n",
                "<div class=\"email-body\">{}</div>\n",
                "</div>\n"
            ),
            i + 1,
            escape_html(subject_or_default(meta)),
            escape_html(meta.from.as_deref().unwrap_or_default()),
            escape_html(meta.to.as_deref().unwrap_or_default()),
            escape_html(&display_date(meta)),
            escape_html(&message.payload.body_text),
        ));
    }
    out.push_str("</body>\n</html>\n");
    out
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}
