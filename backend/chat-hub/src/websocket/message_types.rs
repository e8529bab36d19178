use super::events::codes;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

pub const NOTIFICATION_SYNC_DEFAULT_LIMIT: i64 = 20;
pub const NOTIFICATION_SYNC_MAX_LIMIT: i64 = 50;

/// Inbound frame from a client: `{"type": .., "room_id": .., "data": ..}`.
///
/// `room_id` is kept as a raw string so a malformed id can be reported as
/// `invalid_room_id` instead of failing the whole decode.
#[derive(Debug, Deserialize)]
pub struct WsInboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WsCommand {
    Typing { room_id: Uuid, is_typing: bool },
    Read { room_id: Uuid },
    NotificationSync(SyncParams),
    NotificationRead { id: Uuid },
    NotificationReadAll,
    /// Forward compatibility: unknown types are ignored.
    Unknown(String),
}

impl WsCommand {
    pub fn name(&self) -> &str {
        match self {
            Self::Typing { .. } => "typing",
            Self::Read { .. } => "read",
            Self::NotificationSync(_) => "notification:sync",
            Self::NotificationRead { .. } => "notification:read",
            Self::NotificationReadAll => "notification:read-all",
            Self::Unknown(kind) => kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncParams {
    pub limit: i64,
    pub offset: i64,
    pub unread_only: bool,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            limit: NOTIFICATION_SYNC_DEFAULT_LIMIT,
            offset: 0,
            unread_only: false,
        }
    }
}

impl SyncParams {
    /// Out-of-range or missing values are clamped, never rejected.
    pub fn from_data(data: Option<&Value>) -> Self {
        let Some(data) = data else {
            return Self::default();
        };

        let limit = match data.get("limit").and_then(Value::as_i64) {
            Some(l) if l < 1 => NOTIFICATION_SYNC_DEFAULT_LIMIT,
            Some(l) => l.min(NOTIFICATION_SYNC_MAX_LIMIT),
            None => NOTIFICATION_SYNC_DEFAULT_LIMIT,
        };
        let offset = data
            .get("offset")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0);
        let unread_only = data
            .get("unread_only")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Self {
            limit,
            offset,
            unread_only,
        }
    }
}

/// Decode one text frame into a command. The error is the code to report
/// back to the sender.
pub fn parse_command(text: &str) -> Result<WsCommand, &'static str> {
    let envelope: WsInboundEnvelope =
        serde_json::from_str(text).map_err(|_| codes::INVALID_PAYLOAD)?;
    envelope.into_command()
}

impl WsInboundEnvelope {
    pub fn into_command(self) -> Result<WsCommand, &'static str> {
        match self.kind.as_str() {
            "typing" => {
                let room_id = self.required_room_id()?;
                let is_typing = self
                    .data
                    .as_ref()
                    .and_then(|d| d.get("is_typing"))
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                Ok(WsCommand::Typing { room_id, is_typing })
            }
            "read" => Ok(WsCommand::Read {
                room_id: self.required_room_id()?,
            }),
            "notification:sync" => Ok(WsCommand::NotificationSync(SyncParams::from_data(
                self.data.as_ref(),
            ))),
            "notification:read" => {
                let id = self
                    .data
                    .as_ref()
                    .and_then(|d| d.get("id"))
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or(codes::INVALID_NOTIFICATION_ID)?;
                Ok(WsCommand::NotificationRead { id })
            }
            "notification:read-all" => Ok(WsCommand::NotificationReadAll),
            "" => Err(codes::INVALID_PAYLOAD),
            other => Ok(WsCommand::Unknown(other.to_string())),
        }
    }

    fn required_room_id(&self) -> Result<Uuid, &'static str> {
        self.room_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or(codes::INVALID_ROOM_ID)
    }
}
