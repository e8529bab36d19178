//! Outbound WebSocket events.
//!
//! Every event shares one flat wire shape:
//! ```json
//! {
//!     "type": "new_message",
//!     "room_id": "uuid",
//!     "sender_id": "uuid",
//!     "message_id": "uuid",
//!     "message": { ... },
//!     "data": { ... }
//! }
//! ```
//! Only the fields a kind needs are set; absent fields are omitted from the
//! JSON. Constructors below are the only place events are built.

use crate::models::{MessagePayload, NotificationItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Error codes carried in `error` events.
pub mod codes {
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    pub const INVALID_ROOM_ID: &str = "invalid_room_id";
    pub const INVALID_NOTIFICATION_ID: &str = "invalid_notification_id";
    pub const NOT_SUBSCRIBED: &str = "not_subscribed";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const NOTIFICATION_RATE_LIMITED: &str = "notification_rate_limited";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "new_message")]
    NewMessage,
    #[serde(rename = "message_created")]
    MessageCreated,
    #[serde(rename = "room_updated")]
    RoomUpdated,
    #[serde(rename = "message_deleted")]
    MessageDeleted,
    #[serde(rename = "typing")]
    Typing,
    #[serde(rename = "read")]
    Read,
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "offline")]
    Offline,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "notification:sync")]
    NotificationSync,
    #[serde(rename = "notification:state")]
    NotificationState,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::MessageCreated => "message_created",
            Self::RoomUpdated => "room_updated",
            Self::MessageDeleted => "message_deleted",
            Self::Typing => "typing",
            Self::Read => "read",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
            Self::NotificationSync => "notification:sync",
            Self::NotificationState => "notification:state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl Event {
    fn bare(kind: EventKind) -> Self {
        Self {
            kind,
            room_id: None,
            sender_id: None,
            message_id: None,
            message: None,
            data: None,
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.data = Some(map);
        }
        self
    }

    fn for_message(kind: EventKind, message: &MessagePayload) -> Self {
        Self {
            kind,
            room_id: Some(message.room_id),
            sender_id: Some(message.sender_id),
            message_id: Some(message.id),
            message: Some(message.clone()),
            data: None,
        }
    }

    pub fn new_message(message: &MessagePayload) -> Self {
        Self::for_message(EventKind::NewMessage, message)
    }

    pub fn message_created(message: &MessagePayload) -> Self {
        Self::for_message(EventKind::MessageCreated, message)
    }

    pub fn room_updated(message: &MessagePayload) -> Self {
        Self {
            room_id: Some(message.room_id),
            sender_id: Some(message.sender_id),
            message_id: Some(message.id),
            ..Self::bare(EventKind::RoomUpdated)
        }
        .with_data(json!({
            "last_message_preview": message.preview(),
            "last_message_at": message.created_at.to_rfc3339(),
        }))
    }

    pub fn message_deleted(room_id: Uuid, message_id: Uuid, deleted_by: Uuid) -> Self {
        Self {
            room_id: Some(room_id),
            sender_id: Some(deleted_by),
            message_id: Some(message_id),
            ..Self::bare(EventKind::MessageDeleted)
        }
    }

    pub fn typing(room_id: Uuid, user_id: Uuid, is_typing: bool) -> Self {
        Self {
            room_id: Some(room_id),
            sender_id: Some(user_id),
            ..Self::bare(EventKind::Typing)
        }
        .with_data(json!({ "is_typing": is_typing }))
    }

    pub fn read(room_id: Uuid, user_id: Uuid, read_at: DateTime<Utc>) -> Self {
        Self {
            room_id: Some(room_id),
            sender_id: Some(user_id),
            ..Self::bare(EventKind::Read)
        }
        .with_data(json!({ "read_at": read_at.to_rfc3339() }))
    }

    pub fn online(user_id: Uuid) -> Self {
        Self {
            sender_id: Some(user_id),
            ..Self::bare(EventKind::Online)
        }
    }

    pub fn offline(user_id: Uuid) -> Self {
        Self {
            sender_id: Some(user_id),
            ..Self::bare(EventKind::Offline)
        }
    }

    pub fn error(code: &str) -> Self {
        Self::bare(EventKind::Error).with_data(json!({ "code": code }))
    }

    pub fn notification_sync(
        unread_count: i64,
        items: &[NotificationItem],
        limit: i64,
        offset: i64,
    ) -> Self {
        Self::bare(EventKind::NotificationSync).with_data(json!({
            "unread_count": unread_count,
            "items": items,
            "limit": limit,
            "offset": offset,
        }))
    }

    pub fn notification_read(unread_count: i64, read_ids: &[Uuid]) -> Self {
        Self::bare(EventKind::NotificationState).with_data(json!({
            "unread_count": unread_count,
            "read_ids": read_ids,
        }))
    }

    pub fn notification_read_all(unread_count: i64) -> Self {
        Self::bare(EventKind::NotificationState).with_data(json!({
            "unread_count": unread_count,
            "read_all": true,
        }))
    }

    /// Error code of an `error` event.
    pub fn error_code(&self) -> Option<&str> {
        if self.kind != EventKind::Error {
            return None;
        }
        self.data.as_ref()?.get("code")?.as_str()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
