//! Domain values passed between the fetch client, the parser and callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote handle for one message, as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageReference {
    pub id: String,
    pub thread_id: String,
}

impl MessageReference {
    pub fn new(id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub references: Vec<MessageReference>,
    pub next_page_token: Option<String>,
    pub result_size_estimate: Option<u32>,
}

/// Undecoded RFC 822 bytes plus the metadata the service attaches to them.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub reference: MessageReference,
    pub mime: Vec<u8>,
    pub labels: Vec<String>,
    pub size_estimate: Option<u64>,
    pub snippet: Option<String>,
    /// Milliseconds since the epoch, as reported by the service
    pub internal_date: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub name: Option<String>,
    pub address: String,
}

impl std::fmt::Display for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub filename: String,
    pub content_type: String,
    /// Decoded size in bytes
    pub size: usize,
    /// MIME part path (`1`, `2.1`, ...) accepted by `attachment_content`
    pub content_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub id: String,
    pub thread_id: String,
    pub message_id: Option<String>,
    pub from: Mailbox,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub body_text: String,
    pub body_html: Option<String>,
    pub labels: Vec<String>,
    pub attachments: Vec<AttachmentDescriptor>,
}

impl ParsedMessage {
    /// To and Cc recipients, in header order.
    pub fn recipients(&self) -> impl Iterator<Item = &Mailbox> {
        self.to.iter().chain(self.cc.iter())
    }

    /// First `max_chars` characters of the body on a single line.
    pub fn snippet(&self, max_chars: usize) -> String {
        self.body_text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(max_chars)
            .collect()
    }
}
