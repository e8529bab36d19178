//! Shared publish/subscribe bus used to fan events out across instances.
//!
//! Channel layout:
//! - `chat:room:<room-uuid>`: per-room event relay
//! - `chat:presence`: presence change notices (informational)
//! - `ws:user_events`: user-addressed envelopes (see [`UserEventEnvelope`])
//! - `chat:presence:online`: set of online user ids, TTL refreshed on every
//!   online mark

use crate::error::HubResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub mod memory;
pub mod redis_bus;

pub use self::memory::MemoryBus;
pub use self::redis_bus::RedisBus;

pub const ROOM_CHANNEL_PREFIX: &str = "chat:room:";
pub const ROOM_CHANNEL_PATTERN: &str = "chat:room:*";
pub const PRESENCE_CHANNEL: &str = "chat:presence";
pub const USER_EVENTS_CHANNEL: &str = "ws:user_events";
pub const PRESENCE_ONLINE_KEY: &str = "chat:presence:online";

pub fn room_channel(room_id: Uuid) -> String {
    format!("{}{}", ROOM_CHANNEL_PREFIX, room_id)
}

/// Room id of a `chat:room:<uuid>` channel name.
pub fn parse_room_channel(channel: &str) -> Option<Uuid> {
    channel
        .strip_prefix(ROOM_CHANNEL_PREFIX)
        .and_then(|rest| Uuid::parse_str(rest).ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

pub type BusStream = BoxStream<'static, BusMessage>;

/// Envelope published on `ws:user_events`.
///
/// `sender_instance_id` is required: the publishing instance already
/// delivered locally and must drop its own echo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEventEnvelope {
    pub event_type: String,
    pub user_id: Uuid,
    pub payload: serde_json::Value,
    pub sender_instance_id: Uuid,
}

/// Presence change notice published on `chat:presence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceNotice {
    pub user_id: Uuid,
    pub online: bool,
    pub instance_id: Uuid,
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> HubResult<()>;

    /// Subscribe to exact `channels` and glob `patterns` (trailing `*`).
    async fn subscribe(&self, channels: &[&str], patterns: &[&str]) -> HubResult<BusStream>;

    /// Add `member` to the set at `key` and reset the set's TTL.
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> HubResult<()>;

    async fn set_remove(&self, key: &str, member: &str) -> HubResult<()>;

    /// Membership flag for each of `members`, in order.
    async fn set_contains(&self, key: &str, members: &[String]) -> HubResult<Vec<bool>>;
}
