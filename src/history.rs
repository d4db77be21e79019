//! History Store
//!
//! Per-conversation message logs, one per model class. Each log is a
//! plain append-capped sequence: push to the tail, drop from the head
//! once the configured cap is exceeded. Token-budget filtering happens
//! later, in `context.rs`; this module never drops for size reasons
//! other than the entry cap.

use serde::{Deserialize, Serialize};

use crate::models::ModelClass;
use crate::session::Session;

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One piece of multi-part message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
}

/// Message content: plain text, or ordered parts (text + image refs)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten to a single string for token counting. Image parts
    /// contribute their raw URL string.
    pub fn as_countable_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.as_str(),
                    ContentPart::ImageUrl { url } => url.as_str(),
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Whether this content carries an image reference
    pub fn has_image(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts
                .iter()
                .any(|p| matches!(p, ContentPart::ImageUrl { .. })),
        }
    }
}

/// A single exchanged message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(ChatRole::Assistant, content)
    }

    pub fn user_with_image(caption: Option<&str>, url: impl Into<String>) -> Self {
        let mut parts = Vec::new();
        if let Some(caption) = caption {
            parts.push(ContentPart::Text {
                text: caption.to_string(),
            });
        }
        parts.push(ContentPart::ImageUrl { url: url.into() });
        Self {
            role: ChatRole::User,
            content: MessageContent::Parts(parts),
        }
    }
}

/// Append-capped access to a session's per-class logs
pub struct HistoryStore {
    max_messages: usize,
}

impl HistoryStore {
    pub fn new(max_messages: usize) -> Self {
        Self { max_messages }
    }

    /// Push to the tail of the named log, then drop oldest entries
    /// until the log is back under the cap.
    pub fn append(&self, session: &mut Session, class: ModelClass, message: ChatMessage) {
        let log = session.history_mut(class);
        log.push(message);
        if log.len() > self.max_messages {
            let excess = log.len() - self.max_messages;
            log.drain(..excess);
        }
    }

    pub fn clear(&self, session: &mut Session, class: ModelClass) {
        session.history_mut(class).clear();
    }
}
