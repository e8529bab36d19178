use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest `last_message_preview` carried by `room_updated`, in characters.
const PREVIEW_MAX_CHARS: usize = 100;

/// Message as pushed to clients. Produced by the message store; the hub
/// only relays it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub url: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

fn default_message_type() -> String {
    "text".to_string()
}

impl MessagePayload {
    pub fn text(room_id: Uuid, sender_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            sender_id,
            content: content.into(),
            message_type: default_message_type(),
            created_at: Utc::now(),
            attachments: Vec::new(),
        }
    }

    /// Short text shown in room lists.
    pub fn preview(&self) -> String {
        let trimmed = self.content.trim();
        if trimmed.is_empty() && !self.attachments.is_empty() {
            return "[attachment]".to_string();
        }
        trimmed.chars().take(PREVIEW_MAX_CHARS).collect()
    }
}
