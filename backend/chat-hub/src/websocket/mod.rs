use crate::error::{HubError, HubResult};
use crate::metrics;
use crate::presence::PresenceTracker;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod commands;
pub mod connection;
pub mod events;
pub mod handlers;
pub mod message_types;
pub mod pubsub;

pub use connection::{Connection, ConnectionId, PushOutcome};

/// Result of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub dropped: usize,
}

enum RegistryCommand {
    Register(Arc<Connection>, oneshot::Sender<bool>),
    Unregister(Arc<Connection>, oneshot::Sender<Vec<Uuid>>),
}

struct RegistryInner {
    // user_id -> live connections on this instance
    connections: RwLock<HashMap<Uuid, HashMap<ConnectionId, Arc<Connection>>>>,
    // room_id -> locally subscribed users
    rooms: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    dropped: AtomicU64,
}

impl RegistryInner {
    fn connected_users(&self) -> Vec<Uuid> {
        self.connections.read().keys().copied().collect()
    }

    /// Drop `user_id` from every local room, returning the rooms it left.
    fn leave_all_rooms(&self, user_id: Uuid) -> Vec<Uuid> {
        let mut left = Vec::new();
        self.rooms.write().retain(|room_id, users| {
            if users.remove(&user_id) {
                left.push(*room_id);
            }
            !users.is_empty()
        });
        left
    }
}

/// Per-instance connection and room-subscription registry.
///
/// Register/unregister go through a single actor task so the
/// "first connection" / "last connection" presence transitions are decided
/// by exactly one consumer. Room subscriptions and broadcasts take the
/// locks directly.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
    commands: mpsc::UnboundedSender<RegistryCommand>,
}

impl ConnectionRegistry {
    /// Start the registry actor. It runs until `shutdown` flips to true,
    /// then finishes queued commands and evicts whatever is still
    /// registered before the returned handle resolves.
    pub fn spawn(
        presence: Arc<PresenceTracker>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let inner = Arc::new(RegistryInner {
            connections: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        });
        let (commands, rx) = mpsc::unbounded_channel();

        let actor = tokio::spawn(run_actor(inner.clone(), presence, rx, shutdown));

        (Self { inner, commands }, actor)
    }

    /// Add a connection. Returns true if it is the user's first local one.
    pub async fn register(&self, conn: Arc<Connection>) -> HubResult<bool> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::Register(conn, ack_tx))
            .map_err(|_| HubError::ShuttingDown)?;
        ack_rx.await.map_err(|_| HubError::ShuttingDown)
    }

    /// Remove a connection and close its queue. When it was the user's last
    /// local connection, returns the rooms the user was unsubscribed from.
    pub async fn unregister(&self, conn: Arc<Connection>) -> HubResult<Vec<Uuid>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::Unregister(conn, ack_tx))
            .map_err(|_| HubError::ShuttingDown)?;
        ack_rx.await.map_err(|_| HubError::ShuttingDown)
    }

    pub fn subscribe_room(&self, room_id: Uuid, user_id: Uuid) {
        let mut rooms = self.inner.rooms.write();
        if rooms.entry(room_id).or_default().insert(user_id) {
            debug!(%room_id, %user_id, "room subscription added");
        }
    }

    pub fn unsubscribe_room(&self, room_id: Uuid, user_id: Uuid) {
        let mut rooms = self.inner.rooms.write();
        if let Some(users) = rooms.get_mut(&room_id) {
            users.remove(&user_id);
            if users.is_empty() {
                rooms.remove(&room_id);
            }
        }
    }

    pub fn is_subscribed(&self, room_id: Uuid, user_id: Uuid) -> bool {
        self.inner
            .rooms
            .read()
            .get(&room_id)
            .is_some_and(|users| users.contains(&user_id))
    }

    pub fn room_subscribers(&self, room_id: Uuid) -> Vec<Uuid> {
        self.inner
            .rooms
            .read()
            .get(&room_id)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Push `payload` to every local connection of every user subscribed to
    /// `room_id`. Full queues drop the event for that connection only.
    pub fn local_broadcast(&self, room_id: Uuid, payload: &str) -> DeliveryStats {
        let users = self.room_subscribers(room_id);
        if users.is_empty() {
            return DeliveryStats::default();
        }
        let payload: Arc<str> = Arc::from(payload);
        let connections = self.inner.connections.read();

        let mut stats = DeliveryStats::default();
        for user_id in users {
            if let Some(conns) = connections.get(&user_id) {
                for conn in conns.values() {
                    self.push_counted(conn, payload.clone(), &mut stats);
                }
            }
        }
        stats
    }

    /// Push `payload` to every local connection of `user_id`.
    pub fn deliver_to_user(&self, user_id: Uuid, payload: &str) -> DeliveryStats {
        let payload: Arc<str> = Arc::from(payload);
        let connections = self.inner.connections.read();

        let mut stats = DeliveryStats::default();
        if let Some(conns) = connections.get(&user_id) {
            for conn in conns.values() {
                self.push_counted(conn, payload.clone(), &mut stats);
            }
        }
        stats
    }

    /// Push to a single connection, counting a drop if its queue is full.
    pub fn send_to_connection(&self, conn: &Connection, payload: &str) -> PushOutcome {
        let mut stats = DeliveryStats::default();
        self.push_counted(conn, Arc::from(payload), &mut stats)
    }

    fn push_counted(
        &self,
        conn: &Connection,
        payload: Arc<str>,
        stats: &mut DeliveryStats,
    ) -> PushOutcome {
        let outcome = conn.push(payload);
        match outcome {
            PushOutcome::Queued => stats.delivered += 1,
            PushOutcome::Full => {
                stats.dropped += 1;
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::DROPPED_EVENTS.inc();
                debug!(
                    connection_id = %conn.id(),
                    user_id = %conn.user_id(),
                    "outbound queue full, event dropped"
                );
            }
            PushOutcome::Closed => {}
        }
        outcome
    }

    pub fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .connections
            .read()
            .get(&user_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.inner.connections.read().values().map(|c| c.len()).sum()
    }

    pub fn connected_users(&self) -> Vec<Uuid> {
        self.inner.connected_users()
    }

    /// Close every local connection's queue. Their writers send a close
    /// frame and their readers run the normal unregister path.
    pub fn close_all(&self) -> usize {
        let connections = self.inner.connections.read();
        let mut closed = 0;
        for conn in connections.values().flat_map(|c| c.values()) {
            conn.close();
            closed += 1;
        }
        closed
    }

    /// Events dropped on full queues since the registry started.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

async fn run_actor(
    inner: Arc<RegistryInner>,
    presence: Arc<PresenceTracker>,
    mut rx: mpsc::UnboundedReceiver<RegistryCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = presence.refresh_period();
    let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => handle_command(&inner, &presence, cmd).await,
                None => break,
            },
            _ = refresh.tick() => {
                let users = inner.connected_users();
                if !users.is_empty() {
                    presence.refresh(&users).await;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // commands sent before the stop signal still get an answer
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        handle_command(&inner, &presence, cmd).await;
    }
    evict_remaining(&inner, &presence).await;

    info!("connection registry actor stopped");
}

async fn handle_command(
    inner: &RegistryInner,
    presence: &PresenceTracker,
    command: RegistryCommand,
) {
    match command {
        RegistryCommand::Register(conn, ack) => {
            let user_id = conn.user_id();
            let first = {
                let mut connections = inner.connections.write();
                let conns = connections.entry(user_id).or_default();
                conns.insert(conn.id(), conn.clone());
                conns.len() == 1
            };
            metrics::ACTIVE_CONNECTIONS.inc();
            debug!(%user_id, connection_id = %conn.id(), first, "connection registered");

            if first {
                presence.mark_online(user_id).await;
            }
            let _ = ack.send(first);
        }
        RegistryCommand::Unregister(conn, ack) => {
            let user_id = conn.user_id();
            conn.close();

            let (removed, last) = {
                let mut connections = inner.connections.write();
                match connections.get_mut(&user_id) {
                    Some(conns) => {
                        let removed = conns.remove(&conn.id()).is_some();
                        let last = conns.is_empty();
                        if last {
                            connections.remove(&user_id);
                        }
                        (removed, removed && last)
                    }
                    None => (false, false),
                }
            };

            if removed {
                metrics::ACTIVE_CONNECTIONS.dec();
                debug!(%user_id, connection_id = %conn.id(), last, "connection unregistered");
            }
            let left = if last {
                let left = inner.leave_all_rooms(user_id);
                presence.mark_offline(user_id).await;
                left
            } else {
                Vec::new()
            };
            let _ = ack.send(left);
        }
    }
}

/// Close and forget connections whose readers never unregistered, so their
/// users do not linger in the shared online set.
async fn evict_remaining(inner: &RegistryInner, presence: &PresenceTracker) {
    let leftover: Vec<(Uuid, Vec<Arc<Connection>>)> = inner
        .connections
        .write()
        .drain()
        .map(|(user_id, conns)| (user_id, conns.into_values().collect()))
        .collect();
    if leftover.is_empty() {
        return;
    }

    warn!(users = leftover.len(), "evicting connections still registered at shutdown");
    for (user_id, conns) in leftover {
        for conn in &conns {
            conn.close();
        }
        metrics::ACTIVE_CONNECTIONS.sub(conns.len() as i64);
        inner.leave_all_rooms(user_id);
        presence.mark_offline(user_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, MemoryBus};
    use std::time::Duration;

    struct Harness {
        registry: ConnectionRegistry,
        presence: Arc<PresenceTracker>,
        shutdown: watch::Sender<bool>,
        actor: JoinHandle<()>,
    }

    fn harness(presence: PresenceTracker) -> Harness {
        let presence = Arc::new(presence);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (registry, actor) = ConnectionRegistry::spawn(presence.clone(), shutdown_rx);
        Harness {
            registry,
            presence,
            shutdown,
            actor,
        }
    }

    fn registry() -> (ConnectionRegistry, Arc<PresenceTracker>, watch::Sender<bool>) {
        let h = harness(PresenceTracker::new(
            None,
            Uuid::new_v4(),
            Duration::from_secs(300),
        ));
        (h.registry, h.presence, h.shutdown)
    }

    #[tokio::test]
    async fn broadcast_reaches_only_subscribers() {
        let (registry, _presence, _shutdown) = registry();
        let room = Uuid::new_v4();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let (a, mut a_rx) = Connection::new(alice, 8);
        let (b, mut b_rx) = Connection::new(bob, 8);
        let (c, mut c_rx) = Connection::new(carol, 8);
        for conn in [&a, &b, &c] {
            registry.register(conn.clone()).await.unwrap();
        }
        registry.subscribe_room(room, alice);
        registry.subscribe_room(room, bob);

        let stats = registry.local_broadcast(room, "hello");
        assert_eq!(stats, DeliveryStats { delivered: 2, dropped: 0 });

        assert_eq!(&*a_rx.recv().await.unwrap(), "hello");
        assert_eq!(&*b_rx.recv().await.unwrap(), "hello");
        assert!(c_rx.try_recv().is_err());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_device_of_a_user_receives() {
        let (registry, _presence, _shutdown) = registry();
        let user = Uuid::new_v4();
        let (phone, mut phone_rx) = Connection::new(user, 8);
        let (laptop, mut laptop_rx) = Connection::new(user, 8);
        registry.register(phone).await.unwrap();
        registry.register(laptop).await.unwrap();

        assert_eq!(registry.connection_count(user), 2);
        assert_eq!(registry.deliver_to_user(user, "ping").delivered, 2);
        assert_eq!(&*phone_rx.recv().await.unwrap(), "ping");
        assert_eq!(&*laptop_rx.recv().await.unwrap(), "ping");
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts_without_blocking() {
        let (registry, _presence, _shutdown) = registry();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        let (conn, mut rx) = Connection::new(user, 2);
        registry.register(conn).await.unwrap();
        registry.subscribe_room(room, user);

        for i in 0..5 {
            registry.local_broadcast(room, &format!("e{i}"));
        }

        assert_eq!(registry.dropped_events(), 3);
        assert_eq!(&*rx.recv().await.unwrap(), "e0");
        assert_eq!(&*rx.recv().await.unwrap(), "e1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn presence_follows_first_and_last_connection() {
        let (registry, presence, _shutdown) = registry();
        let user = Uuid::new_v4();
        let (first, _rx1) = Connection::new(user, 4);
        let (second, _rx2) = Connection::new(user, 4);

        assert!(registry.register(first.clone()).await.unwrap());
        assert!(presence.is_online(user).await);
        assert!(!registry.register(second.clone()).await.unwrap());

        registry.unregister(first.clone()).await.unwrap();
        assert!(presence.is_online(user).await);
        assert!(first.is_closed());

        registry.unregister(second).await.unwrap();
        assert!(!presence.is_online(user).await);
        assert_eq!(registry.total_connections(), 0);
    }

    #[tokio::test]
    async fn last_disconnect_clears_room_subscriptions() {
        let (registry, _presence, _shutdown) = registry();
        let (room_a, room_b) = (Uuid::new_v4(), Uuid::new_v4());
        let (user, other) = (Uuid::new_v4(), Uuid::new_v4());
        let (conn, _rx) = Connection::new(user, 4);
        let (other_conn, _orx) = Connection::new(other, 4);
        registry.register(conn.clone()).await.unwrap();
        registry.register(other_conn).await.unwrap();
        registry.subscribe_room(room_a, user);
        registry.subscribe_room(room_b, user);
        registry.subscribe_room(room_b, other);

        let mut left = registry.unregister(conn).await.unwrap();
        left.sort();
        let mut expected = vec![room_a, room_b];
        expected.sort();
        assert_eq!(left, expected);

        assert!(!registry.is_subscribed(room_a, user));
        assert!(!registry.is_subscribed(room_b, user));
        assert!(registry.is_subscribed(room_b, other));
        assert!(registry.room_subscribers(room_a).is_empty());
    }

    #[tokio::test]
    async fn unregister_twice_is_harmless() {
        let (registry, presence, _shutdown) = registry();
        let user = Uuid::new_v4();
        let (conn, _rx) = Connection::new(user, 4);
        registry.register(conn.clone()).await.unwrap();
        registry.unregister(conn.clone()).await.unwrap();
        registry.unregister(conn).await.unwrap();
        assert!(!presence.is_online(user).await);
    }

    #[tokio::test]
    async fn register_fails_after_shutdown() {
        let h = harness(PresenceTracker::new(None, Uuid::new_v4(), Duration::from_secs(300)));
        h.shutdown.send(true).unwrap();
        h.actor.await.unwrap();

        let (conn, _rx) = Connection::new(Uuid::new_v4(), 4);
        assert!(matches!(
            h.registry.register(conn).await,
            Err(HubError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn stopping_evicts_connections_and_clears_presence() {
        let bus = Arc::new(MemoryBus::new());
        let h = harness(PresenceTracker::new(
            Some(bus.clone() as Arc<dyn Bus>),
            Uuid::new_v4(),
            Duration::from_secs(300),
        ));
        let observer =
            PresenceTracker::new(Some(bus as Arc<dyn Bus>), Uuid::new_v4(), Duration::from_secs(300));
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        let (conn, _rx) = Connection::new(user, 4);
        h.registry.register(conn.clone()).await.unwrap();
        h.registry.subscribe_room(room, user);
        assert!(observer.is_online(user).await);

        // the reader never gets to unregister
        h.shutdown.send(true).unwrap();
        h.actor.await.unwrap();

        assert!(conn.is_closed());
        assert_eq!(h.registry.total_connections(), 0);
        assert!(h.registry.room_subscribers(room).is_empty());
        assert!(!observer.is_online(user).await);
    }

    #[tokio::test]
    async fn live_connections_keep_presence_past_the_ttl() {
        let bus = Arc::new(MemoryBus::new());
        let h = harness(PresenceTracker::new(
            Some(bus.clone() as Arc<dyn Bus>),
            Uuid::new_v4(),
            Duration::from_millis(400),
        ));
        let observer =
            PresenceTracker::new(Some(bus as Arc<dyn Bus>), Uuid::new_v4(), Duration::from_secs(300));
        let user = Uuid::new_v4();
        let (conn, _rx) = Connection::new(user, 4);
        h.registry.register(conn.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(observer.is_online(user).await);

        h.registry.unregister(conn).await.unwrap();
        assert!(!observer.is_online(user).await);
    }
}
