use super::{NotificationQuery, NotificationWriter, RoomDirectory};
use crate::error::{HubError, HubResult};
use crate::models::NotificationItem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Process-local stand-in for the room and notification services.
///
/// Used by tests and for running a hub without the REST backend. Can be
/// switched to fail every call, or to stall, to exercise error paths.
#[derive(Default)]
pub struct InMemoryCollaborators {
    memberships: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    read_marks: Mutex<Vec<(Uuid, Uuid, DateTime<Utc>)>>,
    notifications: RwLock<HashMap<Uuid, Vec<NotificationItem>>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl InMemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, room_id: Uuid, user_id: Uuid) {
        let mut memberships = self.memberships.write();
        let rooms = memberships.entry(user_id).or_default();
        if !rooms.contains(&room_id) {
            rooms.push(room_id);
        }
    }

    pub fn remove_member(&self, room_id: Uuid, user_id: Uuid) {
        if let Some(rooms) = self.memberships.write().get_mut(&user_id) {
            rooms.retain(|r| *r != room_id);
        }
    }

    /// Store an unread notification for `user_id` and return its id.
    pub fn push_notification(&self, user_id: Uuid, kind: &str, title: &str) -> Uuid {
        let item = NotificationItem {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            actor_id: None,
            title: Some(title.to_string()),
            body: None,
            data: serde_json::Value::Null,
            read_at: None,
            created_at: Utc::now(),
        };
        let id = item.id;
        self.notifications
            .write()
            .entry(user_id)
            .or_default()
            .push(item);
        id
    }

    /// `(room_id, user_id)` pairs passed to `mark_room_read`, in call order.
    pub fn read_marks(&self) -> Vec<(Uuid, Uuid)> {
        self.read_marks
            .lock()
            .iter()
            .map(|(room, user, _)| (*room, *user))
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stall every call by `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    async fn gate(&self) -> HubResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(HubError::Collaborator("in-memory collaborator failing".into()));
        }
        Ok(())
    }

    fn count_unread(&self, user_id: Uuid) -> i64 {
        self.notifications
            .read()
            .get(&user_id)
            .map(|items| items.iter().filter(|n| !n.is_read()).count() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl RoomDirectory for InMemoryCollaborators {
    async fn list_rooms_for_user(&self, user_id: Uuid) -> HubResult<Vec<Uuid>> {
        self.gate().await?;
        Ok(self
            .memberships
            .read()
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_room_read(&self, room_id: Uuid, user_id: Uuid) -> HubResult<DateTime<Utc>> {
        self.gate().await?;
        let read_at = Utc::now();
        self.read_marks.lock().push((room_id, user_id, read_at));
        Ok(read_at)
    }
}

#[async_trait]
impl NotificationQuery for InMemoryCollaborators {
    async fn list(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
        unread_only: bool,
    ) -> HubResult<Vec<NotificationItem>> {
        self.gate().await?;
        let notifications = self.notifications.read();
        let Some(items) = notifications.get(&user_id) else {
            return Ok(Vec::new());
        };

        let mut page: Vec<NotificationItem> = items
            .iter()
            .filter(|n| !unread_only || !n.is_read())
            .cloned()
            .collect();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn unread_count(&self, user_id: Uuid) -> HubResult<i64> {
        self.gate().await?;
        Ok(self.count_unread(user_id))
    }
}

#[async_trait]
impl NotificationWriter for InMemoryCollaborators {
    async fn mark_as_read(&self, user_id: Uuid, notification_id: Uuid) -> HubResult<()> {
        self.gate().await?;
        let mut notifications = self.notifications.write();
        let item = notifications
            .get_mut(&user_id)
            .and_then(|items| items.iter_mut().find(|n| n.id == notification_id))
            .ok_or_else(|| {
                HubError::Collaborator(format!("notification {} not found", notification_id))
            })?;
        if item.read_at.is_none() {
            item.read_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_all_read(&self, user_id: Uuid) -> HubResult<u64> {
        self.gate().await?;
        let now = Utc::now();
        let mut changed = 0;
        if let Some(items) = self.notifications.write().get_mut(&user_id) {
            for item in items.iter_mut().filter(|n| n.read_at.is_none()) {
                item.read_at = Some(now);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn unread_count(&self, user_id: Uuid) -> HubResult<i64> {
        self.gate().await?;
        Ok(self.count_unread(user_id))
    }
}
