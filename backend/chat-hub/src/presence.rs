//! Online presence.
//!
//! The authoritative view is the shared `chat:presence:online` set. Each
//! instance also keeps the users it holds connections for, which answers
//! queries when the bus is absent or failing.

use crate::bus::{Bus, PresenceNotice, PRESENCE_CHANNEL, PRESENCE_ONLINE_KEY};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const MIN_REFRESH_PERIOD: Duration = Duration::from_millis(100);

pub struct PresenceTracker {
    bus: Option<Arc<dyn Bus>>,
    instance_id: Uuid,
    ttl: Duration,
    local: RwLock<HashSet<Uuid>>,
}

impl PresenceTracker {
    pub fn new(bus: Option<Arc<dyn Bus>>, instance_id: Uuid, ttl: Duration) -> Self {
        Self {
            bus,
            instance_id,
            ttl,
            local: RwLock::new(HashSet::new()),
        }
    }

    /// Called on a user's zero-to-one local connection transition.
    pub async fn mark_online(&self, user_id: Uuid) {
        self.local.write().insert(user_id);

        let Some(bus) = &self.bus else {
            return;
        };
        if let Err(e) = bus
            .set_add(PRESENCE_ONLINE_KEY, &user_id.to_string(), self.ttl)
            .await
        {
            warn!(%user_id, error = %e, "presence: failed to mark online on shared bus");
            return;
        }
        self.publish_notice(bus.as_ref(), user_id, true).await;
    }

    /// Called on a user's one-to-zero local connection transition.
    ///
    /// This only retracts this instance's claim; if another instance still
    /// holds the user the next online mark there re-adds them.
    pub async fn mark_offline(&self, user_id: Uuid) {
        self.local.write().remove(&user_id);

        let Some(bus) = &self.bus else {
            return;
        };
        if let Err(e) = bus
            .set_remove(PRESENCE_ONLINE_KEY, &user_id.to_string())
            .await
        {
            warn!(%user_id, error = %e, "presence: failed to mark offline on shared bus");
            return;
        }
        self.publish_notice(bus.as_ref(), user_id, false).await;
    }

    /// Re-add users this instance still holds. The shared set's TTL covers
    /// the whole set, so it must be renewed while anyone is connected.
    pub async fn refresh(&self, user_ids: &[Uuid]) {
        let Some(bus) = &self.bus else {
            return;
        };
        for user_id in user_ids {
            if let Err(e) = bus
                .set_add(PRESENCE_ONLINE_KEY, &user_id.to_string(), self.ttl)
                .await
            {
                warn!(error = %e, users = user_ids.len(), "presence: refresh failed");
                return;
            }
        }
        debug!(users = user_ids.len(), "presence refreshed");
    }

    /// How often [`PresenceTracker::refresh`] should run: half the TTL.
    pub fn refresh_period(&self) -> Duration {
        (self.ttl / 2).max(MIN_REFRESH_PERIOD)
    }

    async fn publish_notice(&self, bus: &dyn Bus, user_id: Uuid, online: bool) {
        let notice = PresenceNotice {
            user_id,
            online,
            instance_id: self.instance_id,
        };
        let payload = match serde_json::to_string(&notice) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "presence: failed to encode notice");
                return;
            }
        };
        if let Err(e) = bus.publish(PRESENCE_CHANNEL, &payload).await {
            debug!(%user_id, error = %e, "presence: notice not published");
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.online_among(&[user_id]).await.contains(&user_id)
    }

    /// Subset of `user_ids` that is online, in input order. One bus round
    /// trip regardless of the input size.
    pub async fn online_among(&self, user_ids: &[Uuid]) -> Vec<Uuid> {
        if user_ids.is_empty() {
            return Vec::new();
        }

        if let Some(bus) = &self.bus {
            let members: Vec<String> = user_ids.iter().map(Uuid::to_string).collect();
            match bus.set_contains(PRESENCE_ONLINE_KEY, &members).await {
                Ok(flags) => {
                    return user_ids
                        .iter()
                        .zip(flags)
                        .filter_map(|(id, online)| online.then_some(*id))
                        .collect();
                }
                Err(e) => {
                    warn!(error = %e, "presence: shared lookup failed, answering from local state");
                }
            }
        }

        let local = self.local.read();
        user_ids
            .iter()
            .filter(|id| local.contains(id))
            .copied()
            .collect()
    }

    pub fn is_locally_online(&self, user_id: Uuid) -> bool {
        self.local.read().contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use futures::StreamExt;

    fn tracker(bus: Option<Arc<MemoryBus>>) -> PresenceTracker {
        PresenceTracker::new(
            bus.map(|b| b as Arc<dyn Bus>),
            Uuid::new_v4(),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn local_only_mode() {
        let presence = tracker(None);
        let user = Uuid::new_v4();

        assert!(!presence.is_online(user).await);
        presence.mark_online(user).await;
        assert!(presence.is_online(user).await);
        presence.mark_offline(user).await;
        assert!(!presence.is_online(user).await);
    }

    #[tokio::test]
    async fn shared_set_is_visible_to_other_instances() {
        let bus = Arc::new(MemoryBus::new());
        let a = tracker(Some(bus.clone()));
        let b = tracker(Some(bus.clone()));
        let user = Uuid::new_v4();

        a.mark_online(user).await;
        assert!(b.is_online(user).await);
        assert!(!b.is_locally_online(user));

        a.mark_offline(user).await;
        assert!(!b.is_online(user).await);
    }

    #[tokio::test]
    async fn falls_back_to_local_state_during_outage() {
        let bus = Arc::new(MemoryBus::new());
        let presence = tracker(Some(bus.clone()));
        let user = Uuid::new_v4();

        bus.set_available(false);
        presence.mark_online(user).await;
        assert!(presence.is_online(user).await);
        presence.mark_offline(user).await;
        assert!(!presence.is_online(user).await);
    }

    #[tokio::test]
    async fn online_among_keeps_input_order() {
        let bus = Arc::new(MemoryBus::new());
        let presence = tracker(Some(bus));
        let users: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

        presence.mark_online(users[3]).await;
        presence.mark_online(users[1]).await;

        assert_eq!(presence.online_among(&users).await, vec![users[1], users[3]]);
        assert!(presence.online_among(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn refresh_renews_the_shared_set() {
        let bus = Arc::new(MemoryBus::new());
        let presence = PresenceTracker::new(
            Some(bus.clone() as Arc<dyn Bus>),
            Uuid::new_v4(),
            Duration::from_millis(100),
        );
        let user = Uuid::new_v4();
        presence.mark_online(user).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        presence.refresh(&[user]).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(presence.is_online(user).await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!presence.is_online(user).await);
    }

    #[tokio::test]
    async fn refresh_heals_a_missed_online_mark() {
        let bus = Arc::new(MemoryBus::new());
        let presence = tracker(Some(bus.clone()));
        let observer = tracker(Some(bus.clone()));
        let user = Uuid::new_v4();

        bus.set_available(false);
        presence.mark_online(user).await;
        bus.set_available(true);
        assert!(!observer.is_online(user).await);

        presence.refresh(&[user]).await;
        assert!(observer.is_online(user).await);
    }

    #[test]
    fn refresh_period_is_half_the_ttl() {
        let presence = PresenceTracker::new(None, Uuid::new_v4(), Duration::from_secs(300));
        assert_eq!(presence.refresh_period(), Duration::from_secs(150));
        let tiny = PresenceTracker::new(None, Uuid::new_v4(), Duration::from_millis(10));
        assert_eq!(tiny.refresh_period(), MIN_REFRESH_PERIOD);
    }

    #[tokio::test]
    async fn state_changes_publish_notices() {
        let bus = Arc::new(MemoryBus::new());
        let mut notices = bus.subscribe(&[PRESENCE_CHANNEL], &[]).await.unwrap();
        let presence = tracker(Some(bus.clone()));
        let user = Uuid::new_v4();

        presence.mark_online(user).await;
        presence.mark_offline(user).await;

        let online: PresenceNotice =
            serde_json::from_str(&notices.next().await.unwrap().payload).unwrap();
        let offline: PresenceNotice =
            serde_json::from_str(&notices.next().await.unwrap().payload).unwrap();
        assert!(online.online && online.user_id == user);
        assert!(!offline.online);
    }
}
