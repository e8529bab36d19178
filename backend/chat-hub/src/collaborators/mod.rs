//! Narrow interfaces onto the services that own rooms and notifications.
//!
//! The hub never stores rooms, messages or notifications itself; it asks
//! these collaborators and fans the answers out.

use crate::error::{HubError, HubResult};
use crate::models::NotificationItem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

pub mod http;
pub mod memory;

pub use self::http::HttpCollaborators;
pub use self::memory::InMemoryCollaborators;

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Rooms `user_id` is currently a member of.
    async fn list_rooms_for_user(&self, user_id: Uuid) -> HubResult<Vec<Uuid>>;

    /// Persist that `user_id` has read `room_id` up to now. Returns the
    /// recorded read time.
    async fn mark_room_read(&self, room_id: Uuid, user_id: Uuid) -> HubResult<DateTime<Utc>>;
}

#[async_trait]
pub trait NotificationQuery: Send + Sync {
    async fn list(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
        unread_only: bool,
    ) -> HubResult<Vec<NotificationItem>>;

    async fn unread_count(&self, user_id: Uuid) -> HubResult<i64>;
}

#[async_trait]
pub trait NotificationWriter: Send + Sync {
    async fn mark_as_read(&self, user_id: Uuid, notification_id: Uuid) -> HubResult<()>;

    /// Returns how many notifications changed state.
    async fn mark_all_read(&self, user_id: Uuid) -> HubResult<u64>;

    async fn unread_count(&self, user_id: Uuid) -> HubResult<i64>;
}

/// The collaborator set a hub is built with.
#[derive(Clone)]
pub struct Collaborators {
    pub rooms: Arc<dyn RoomDirectory>,
    pub notifications: Arc<dyn NotificationQuery>,
    pub notification_writer: Arc<dyn NotificationWriter>,
}

impl Collaborators {
    /// Use one value for all three roles.
    pub fn shared<T>(inner: Arc<T>) -> Self
    where
        T: RoomDirectory + NotificationQuery + NotificationWriter + 'static,
    {
        Self {
            rooms: inner.clone(),
            notifications: inner.clone(),
            notification_writer: inner,
        }
    }
}

/// Bound a collaborator call. The deadline is independent of whatever the
/// caller is doing; expiry surfaces as [`HubError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> HubResult<T>
where
    F: Future<Output = HubResult<T>>,
{
    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(HubError::Timeout(deadline)),
    }
}
