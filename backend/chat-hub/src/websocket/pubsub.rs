use super::events::Event;
use super::{ConnectionRegistry, DeliveryStats};
use crate::bus::{
    parse_room_channel, room_channel, Bus, BusMessage, BusStream, PresenceNotice,
    UserEventEnvelope, PRESENCE_CHANNEL, ROOM_CHANNEL_PATTERN, USER_EVENTS_CHANNEL,
};
use crate::error::HubResult;
use crate::metrics;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How a room broadcast reached local connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomDelivery {
    /// Published; every instance (this one included) delivers from its
    /// subscription loop.
    Relayed,
    /// Delivered directly by the publisher.
    Local(DeliveryStats),
}

/// Relays events between this instance's registry and the shared bus.
///
/// Room events have a single delivery path: the subscription loop. The
/// publisher only delivers directly when there is no bus, the publish
/// failed, or it is not currently subscribed. User events are delivered
/// locally first and then published; the envelope's `sender_instance_id`
/// lets this instance drop its own echo.
pub struct BusBridge {
    instance_id: Uuid,
    bus: Option<Arc<dyn Bus>>,
    registry: ConnectionRegistry,
    subscribed: AtomicBool,
    // held while resubscribing and while publishing in the unsubscribed
    // fallback, so a fallback publish never echoes back to this instance
    resubscribe_gate: Mutex<()>,
}

impl BusBridge {
    /// Build the bridge and, when a bus is configured, subscribe before
    /// returning so the first broadcast already has a relay path.
    pub async fn start(
        instance_id: Uuid,
        bus: Option<Arc<dyn Bus>>,
        registry: ConnectionRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, Option<JoinHandle<()>>) {
        let bridge = Arc::new(Self {
            instance_id,
            bus: bus.clone(),
            registry,
            subscribed: AtomicBool::new(false),
            resubscribe_gate: Mutex::new(()),
        });

        let Some(bus) = bus else {
            info!(%instance_id, "no shared bus configured, running in local-only mode");
            return (bridge, None);
        };

        let initial = match subscribe_all(bus.as_ref()).await {
            Ok(stream) => {
                bridge.subscribed.store(true, Ordering::SeqCst);
                Some(stream)
            }
            Err(e) => {
                warn!(error = %e, "initial bus subscription failed, will retry");
                None
            }
        };

        let handle = tokio::spawn(bridge.clone().run(bus, initial, shutdown));
        (bridge, Some(handle))
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn has_bus(&self) -> bool {
        self.bus.is_some()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// BroadcastToRoom.
    pub async fn publish_to_room(&self, room_id: Uuid, event: &Event) -> HubResult<RoomDelivery> {
        let payload = event.to_json()?;

        let Some(bus) = &self.bus else {
            return Ok(RoomDelivery::Local(
                self.registry.local_broadcast(room_id, &payload),
            ));
        };

        let channel = room_channel(room_id);
        if !self.is_subscribed() {
            let _gate = self.resubscribe_gate.lock().await;
            if !self.is_subscribed() {
                // our own publish will not come back to us
                let stats = self.registry.local_broadcast(room_id, &payload);
                if let Err(e) = bus.publish(&channel, &payload).await {
                    metrics::BUS_PUBLISH_FAILURES.with_label_values(&["room"]).inc();
                    debug!(%room_id, error = %e, "room publish failed while unsubscribed");
                }
                return Ok(RoomDelivery::Local(stats));
            }
        }

        match bus.publish(&channel, &payload).await {
            Ok(()) => Ok(RoomDelivery::Relayed),
            Err(e) => {
                metrics::BUS_PUBLISH_FAILURES.with_label_values(&["room"]).inc();
                warn!(%room_id, error = %e, "room publish failed, delivering locally only");
                Ok(RoomDelivery::Local(
                    self.registry.local_broadcast(room_id, &payload),
                ))
            }
        }
    }

    /// SendToUser. Local delivery happens whether or not the bus is up.
    pub async fn publish_to_user(&self, user_id: Uuid, event: &Event) -> HubResult<DeliveryStats> {
        let payload = event.to_json()?;
        let stats = self.registry.deliver_to_user(user_id, &payload);

        let Some(bus) = &self.bus else {
            return Ok(stats);
        };

        let envelope = UserEventEnvelope {
            event_type: event.kind.as_str().to_string(),
            user_id,
            payload: serde_json::to_value(event)?,
            sender_instance_id: self.instance_id,
        };
        let encoded = serde_json::to_string(&envelope)?;
        if let Err(e) = bus.publish(USER_EVENTS_CHANNEL, &encoded).await {
            metrics::BUS_PUBLISH_FAILURES.with_label_values(&["user"]).inc();
            warn!(%user_id, error = %e, "user event publish failed, other instances will miss it");
        }
        Ok(stats)
    }

    /// Route one message from the subscription to local connections.
    pub(crate) fn handle_message(&self, msg: BusMessage) {
        if let Some(room_id) = parse_room_channel(&msg.channel) {
            metrics::BUS_EVENTS_RECEIVED.with_label_values(&["room"]).inc();
            self.registry.local_broadcast(room_id, &msg.payload);
            return;
        }

        match msg.channel.as_str() {
            USER_EVENTS_CHANNEL => {
                metrics::BUS_EVENTS_RECEIVED.with_label_values(&["user"]).inc();
                self.handle_user_event(&msg.payload);
            }
            PRESENCE_CHANNEL => {
                metrics::BUS_EVENTS_RECEIVED.with_label_values(&["presence"]).inc();
                match serde_json::from_str::<PresenceNotice>(&msg.payload) {
                    Ok(notice) => debug!(
                        user_id = %notice.user_id,
                        online = notice.online,
                        origin = %notice.instance_id,
                        "presence notice"
                    ),
                    Err(e) => debug!(error = %e, "unparseable presence notice"),
                }
            }
            other => debug!(channel = %other, "ignoring message on unexpected channel"),
        }
    }

    fn handle_user_event(&self, raw: &str) {
        let envelope: UserEventEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "malformed user event envelope");
                return;
            }
        };

        if envelope.sender_instance_id == self.instance_id {
            // already delivered locally before publishing
            return;
        }

        let payload = envelope.payload.to_string();
        let stats = self.registry.deliver_to_user(envelope.user_id, &payload);
        debug!(
            user_id = %envelope.user_id,
            event_type = %envelope.event_type,
            delivered = stats.delivered,
            "relayed user event"
        );
    }

    async fn run(
        self: Arc<Self>,
        bus: Arc<dyn Bus>,
        mut stream: Option<BusStream>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if stream.is_none() {
                let resubscribed = {
                    let _gate = self.resubscribe_gate.lock().await;
                    let result = subscribe_all(bus.as_ref()).await;
                    if result.is_ok() {
                        self.subscribed.store(true, Ordering::SeqCst);
                    }
                    result
                };
                match resubscribed {
                    Ok(s) => {
                        info!("bus subscription re-established");
                        stream = Some(s);
                        backoff = INITIAL_BACKOFF;
                    }
                    Err(e) => {
                        warn!(error = %e, retry_in = ?backoff, "bus subscribe failed");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
                continue;
            }
            let Some(active) = stream.as_mut() else {
                continue;
            };

            let next = tokio::select! {
                next = active.next() => next,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match next {
                Some(msg) => self.handle_message(msg),
                None => {
                    warn!("bus subscription ended");
                    self.subscribed.store(false, Ordering::SeqCst);
                    stream = None;
                }
            }
        }

        self.subscribed.store(false, Ordering::SeqCst);
        drop(stream);
        info!(instance_id = %self.instance_id, "bus subscription loop stopped");
    }
}

async fn subscribe_all(bus: &dyn Bus) -> HubResult<BusStream> {
    bus.subscribe(&[PRESENCE_CHANNEL, USER_EVENTS_CHANNEL], &[ROOM_CHANNEL_PATTERN])
        .await
}
