use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "You",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Audio,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, url: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4().to_string(), kind, url: url.into() }
    }

    /// Last path segment of the URL, used when listing attachments.
    pub fn file_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub model: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_used: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    pub metadata: MessageMetadata,
}

impl ChatMessage {
    /// Builds a message stamped with the current time. The id is the creation
    /// time in epoch millis, kept strictly above the last id in `log`.
    pub fn new(log: &[ChatMessage], role: Role, content: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: next_message_id(log, now).to_string(),
            role,
            content: content.into(),
            attachments: None,
            metadata: MessageMetadata { model: model.into(), timestamp: now, tokens: None, tools_used: None },
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        if !attachments.is_empty() {
            self.attachments = Some(attachments);
        }
        self
    }

    pub fn with_tokens(mut self, tokens: Option<u64>) -> Self {
        self.metadata.tokens = tokens;
        self
    }
}

fn next_message_id(log: &[ChatMessage], now: i64) -> i64 {
    match log.last().and_then(|m| m.id.parse::<i64>().ok()) {
        Some(last) if last >= now => last + 1,
        _ => now,
    }
}

/// Rough token estimate: the number of pieces when splitting on single spaces.
pub fn approximate_tokens(text: &str) -> u64 {
    text.split(' ').count() as u64
}

/// The `{role, content}` projection sent to the chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(m: &ChatMessage) -> Self {
        Self { role: m.role, content: m.content.clone() }
    }
}
