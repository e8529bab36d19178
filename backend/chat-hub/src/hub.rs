//! The hub's public surface: what the connection engine, the internal HTTP
//! routes, and embedding services call.

use crate::bus::Bus;
use crate::collaborators::{with_deadline, Collaborators};
use crate::config::Config;
use crate::error::HubResult;
use crate::models::MessagePayload;
use crate::presence::PresenceTracker;
use crate::rate_limit::WindowLimiter;
use crate::websocket::events::Event;
use crate::websocket::pubsub::{BusBridge, RoomDelivery};
use crate::websocket::{Connection, ConnectionRegistry, DeliveryStats};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

pub struct Hub {
    config: Arc<Config>,
    registry: ConnectionRegistry,
    presence: Arc<PresenceTracker>,
    bridge: Arc<BusBridge>,
    collaborators: Collaborators,
    message_limiter: Arc<WindowLimiter>,
    sync_limiter: WindowLimiter,
    read_limiter: WindowLimiter,
    bus_shutdown: watch::Sender<bool>,
    registry_shutdown: watch::Sender<bool>,
    bus_task: Mutex<Option<JoinHandle<()>>>,
    registry_task: Mutex<Option<JoinHandle<()>>>,
}

const DRAIN_POLL: Duration = Duration::from_millis(10);

impl Hub {
    /// Start the registry actor and, when `bus` is given, the bus
    /// subscription. Without a bus the hub serves this process only.
    pub async fn start(
        config: Config,
        bus: Option<Arc<dyn Bus>>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let instance_id = config.instance_id;

        let (bus_shutdown, bus_shutdown_rx) = watch::channel(false);
        let (registry_shutdown, registry_shutdown_rx) = watch::channel(false);

        let presence = Arc::new(PresenceTracker::new(
            bus.clone(),
            instance_id,
            config.presence_ttl(),
        ));
        let (registry, registry_task) =
            ConnectionRegistry::spawn(presence.clone(), registry_shutdown_rx);
        let (bridge, bus_task) =
            BusBridge::start(instance_id, bus, registry.clone(), bus_shutdown_rx).await;

        let hub = Arc::new(Self {
            message_limiter: Arc::new(WindowLimiter::new(
                config.message_rate_limit,
                Duration::from_secs(config.message_rate_window_secs),
            )),
            sync_limiter: WindowLimiter::new(
                config.notification_sync_limit,
                Duration::from_secs(config.notification_sync_window_secs),
            ),
            read_limiter: WindowLimiter::new(
                config.notification_read_limit,
                Duration::from_secs(config.notification_read_window_secs),
            ),
            config,
            registry,
            presence,
            bridge,
            collaborators,
            bus_shutdown,
            registry_shutdown,
            bus_task: Mutex::new(bus_task),
            registry_task: Mutex::new(Some(registry_task)),
        });

        info!(
            %instance_id,
            shared_bus = hub.bridge.has_bus(),
            "chat hub started"
        );
        hub
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instance_id(&self) -> Uuid {
        self.config.instance_id
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Run a collaborator call under the configured deadline.
    pub async fn call_collaborator<T, F>(&self, fut: F) -> HubResult<T>
    where
        F: Future<Output = HubResult<T>>,
    {
        with_deadline(self.config.collaborator_timeout(), fut).await
    }

    pub async fn register(&self, conn: Arc<Connection>) -> HubResult<bool> {
        self.registry.register(conn).await
    }

    pub async fn unregister(&self, conn: Arc<Connection>) -> HubResult<Vec<Uuid>> {
        self.registry.unregister(conn).await
    }

    pub fn subscribe_room(&self, room_id: Uuid, user_id: Uuid) {
        self.registry.subscribe_room(room_id, user_id);
    }

    pub fn unsubscribe_room(&self, room_id: Uuid, user_id: Uuid) {
        self.registry.unsubscribe_room(room_id, user_id);
    }

    pub async fn broadcast_to_room(&self, room_id: Uuid, event: &Event) -> HubResult<RoomDelivery> {
        self.bridge.publish_to_room(room_id, event).await
    }

    /// Deliver to every connection of `user_id` across the fleet. The
    /// returned stats cover this instance only.
    pub async fn send_to_user(&self, user_id: Uuid, event: &Event) -> HubResult<DeliveryStats> {
        self.bridge.publish_to_user(user_id, event).await
    }

    /// The "message sent" fan-out: `new_message`, `message_created`, then
    /// `room_updated`.
    pub async fn announce_message(&self, room_id: Uuid, message: &MessagePayload) -> HubResult<()> {
        let mut message = message.clone();
        message.room_id = room_id;

        for event in [
            Event::new_message(&message),
            Event::message_created(&message),
            Event::room_updated(&message),
        ] {
            self.broadcast_to_room(room_id, &event).await?;
        }
        Ok(())
    }

    pub async fn announce_message_deleted(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        deleted_by: Uuid,
    ) -> HubResult<()> {
        self.broadcast_to_room(
            room_id,
            &Event::message_deleted(room_id, message_id, deleted_by),
        )
        .await
        .map(|_| ())
    }

    /// Tell `rooms` that `user_id` came online or went offline on this
    /// instance.
    pub async fn announce_presence(&self, user_id: Uuid, rooms: &[Uuid], online: bool) {
        let event = if online {
            Event::online(user_id)
        } else {
            Event::offline(user_id)
        };
        for room_id in rooms {
            if let Err(e) = self.broadcast_to_room(*room_id, &event).await {
                warn!(%user_id, %room_id, error = %e, "presence announcement failed");
            }
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.presence.is_online(user_id).await
    }

    pub async fn online_among(&self, user_ids: &[Uuid]) -> Vec<Uuid> {
        self.presence.online_among(user_ids).await
    }

    pub fn local_connection_count(&self, user_id: Uuid) -> usize {
        self.registry.connection_count(user_id)
    }

    pub fn total_local_connections(&self) -> usize {
        self.registry.total_connections()
    }

    pub fn dropped_events(&self) -> u64 {
        self.registry.dropped_events()
    }

    /// General per-user budget, shared by `typing`/`read` and by message
    /// sends made through the REST service. Keyed by user id.
    pub fn message_limiter(&self) -> &Arc<WindowLimiter> {
        &self.message_limiter
    }

    pub(crate) fn sync_limiter(&self) -> &WindowLimiter {
        &self.sync_limiter
    }

    pub(crate) fn read_limiter(&self) -> &WindowLimiter {
        &self.read_limiter
    }

    pub fn is_bus_subscribed(&self) -> bool {
        self.bridge.is_subscribed()
    }

    /// Stop the bus subscription, close local connections and wait for
    /// their readers to unregister, then stop the registry actor.
    ///
    /// Readers that miss the `write_wait` deadline are evicted by the actor,
    /// so every user held here is marked offline before this returns.
    pub async fn shutdown(&self) {
        let _ = self.bus_shutdown.send(true);
        let bus_task = self.bus_task.lock().take();
        if let Some(task) = bus_task {
            if let Err(e) = task.await {
                warn!(error = %e, "bus subscription task ended abnormally");
            }
        }

        let closed = self.registry.close_all();
        if !self.drain_connections(self.config.write_wait()).await {
            warn!(
                remaining = self.registry.total_connections(),
                "connections did not unregister before the drain deadline"
            );
        }

        let _ = self.registry_shutdown.send(true);
        let registry_task = self.registry_task.lock().take();
        if let Some(task) = registry_task {
            if let Err(e) = task.await {
                warn!(error = %e, "registry actor ended abnormally");
            }
        }
        info!(closed_connections = closed, "chat hub stopped");
    }

    async fn drain_connections(&self, deadline: Duration) -> bool {
        let drained = async {
            while self.registry.total_connections() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        tokio::time::timeout(deadline, drained).await.is_ok()
    }
}
