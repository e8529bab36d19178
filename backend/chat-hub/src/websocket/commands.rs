//! Inbound command dispatch for one connection.
//!
//! Failures here are reported to the sending connection as `error` events
//! and never end the connection.

use super::events::{codes, Event};
use super::message_types::{parse_command, SyncParams, WsCommand};
use super::Connection;
use crate::error::HubError;
use crate::hub::Hub;
use crate::metrics;
use crate::rate_limit::WindowLimiter;
use tracing::{debug, warn};
use uuid::Uuid;

type CommandResult = Result<(), &'static str>;

/// Handle one inbound text frame.
pub async fn handle_text(hub: &Hub, conn: &Connection, text: &str) {
    let command = match parse_command(text) {
        Ok(command) => command,
        Err(code) => {
            debug!(user_id = %conn.user_id(), code, "rejected inbound frame");
            reply_error(hub, conn, code);
            return;
        }
    };

    let name = command.name().to_string();
    if let Err(code) = execute(hub, conn, command).await {
        debug!(user_id = %conn.user_id(), command = %name, code, "command failed");
        reply_error(hub, conn, code);
    }
}

async fn execute(hub: &Hub, conn: &Connection, command: WsCommand) -> CommandResult {
    let user_id = conn.user_id();

    match command {
        WsCommand::Typing { room_id, is_typing } => {
            check(hub.message_limiter(), user_id, "typing", codes::RATE_LIMITED)?;
            ensure_subscribed(hub, room_id, user_id)?;
            hub.broadcast_to_room(room_id, &Event::typing(room_id, user_id, is_typing))
                .await
                .map_err(internal)?;
        }
        WsCommand::Read { room_id } => {
            check(hub.message_limiter(), user_id, "read", codes::RATE_LIMITED)?;
            ensure_subscribed(hub, room_id, user_id)?;
            let read_at = hub
                .call_collaborator(hub.collaborators().rooms.mark_room_read(room_id, user_id))
                .await
                .map_err(internal)?;
            hub.broadcast_to_room(room_id, &Event::read(room_id, user_id, read_at))
                .await
                .map_err(internal)?;
        }
        WsCommand::NotificationSync(params) => {
            check(
                hub.sync_limiter(),
                user_id,
                "notification:sync",
                codes::NOTIFICATION_RATE_LIMITED,
            )?;
            send_sync(hub, conn, params).await?;
        }
        WsCommand::NotificationRead { id } => {
            check(
                hub.read_limiter(),
                user_id,
                "notification:read",
                codes::NOTIFICATION_RATE_LIMITED,
            )?;
            let writer = &hub.collaborators().notification_writer;
            hub.call_collaborator(writer.mark_as_read(user_id, id))
                .await
                .map_err(internal)?;
            let unread = hub
                .call_collaborator(writer.unread_count(user_id))
                .await
                .map_err(internal)?;
            hub.send_to_user(user_id, &Event::notification_read(unread, &[id]))
                .await
                .map_err(internal)?;
        }
        WsCommand::NotificationReadAll => {
            check(
                hub.read_limiter(),
                user_id,
                "notification:read-all",
                codes::NOTIFICATION_RATE_LIMITED,
            )?;
            let writer = &hub.collaborators().notification_writer;
            let changed = hub
                .call_collaborator(writer.mark_all_read(user_id))
                .await
                .map_err(internal)?;
            let unread = hub
                .call_collaborator(writer.unread_count(user_id))
                .await
                .map_err(internal)?;
            debug!(%user_id, changed, "marked all notifications read");
            hub.send_to_user(user_id, &Event::notification_read_all(unread))
                .await
                .map_err(internal)?;
        }
        WsCommand::Unknown(kind) => {
            debug!(%user_id, %kind, "ignoring unknown command");
        }
    }
    Ok(())
}

/// Reply to `conn` alone with a page of notifications and the unread count.
pub async fn send_sync(hub: &Hub, conn: &Connection, params: SyncParams) -> CommandResult {
    let user_id = conn.user_id();
    let query = &hub.collaborators().notifications;

    let (unread, items) = tokio::join!(
        hub.call_collaborator(query.unread_count(user_id)),
        hub.call_collaborator(query.list(user_id, params.limit, params.offset, params.unread_only)),
    );
    let unread = unread.map_err(internal)?;
    let items = items.map_err(internal)?;

    let event = Event::notification_sync(unread, &items, params.limit, params.offset);
    reply(hub, conn, &event);
    Ok(())
}

fn check(
    limiter: &WindowLimiter,
    user_id: Uuid,
    command: &str,
    code: &'static str,
) -> CommandResult {
    if limiter.allow(&user_id.to_string()) {
        return Ok(());
    }
    metrics::RATE_LIMITED_COMMANDS
        .with_label_values(&[command])
        .inc();
    Err(code)
}

fn ensure_subscribed(hub: &Hub, room_id: Uuid, user_id: Uuid) -> CommandResult {
    if hub.registry().is_subscribed(room_id, user_id) {
        Ok(())
    } else {
        Err(codes::NOT_SUBSCRIBED)
    }
}

fn internal(e: HubError) -> &'static str {
    warn!(error = %e, retryable = e.is_retryable(), "command collaborator call failed");
    codes::INTERNAL_ERROR
}

fn reply(hub: &Hub, conn: &Connection, event: &Event) {
    match event.to_json() {
        Ok(payload) => {
            hub.registry().send_to_connection(conn, &payload);
        }
        Err(e) => warn!(error = %e, "failed to encode reply"),
    }
}

pub(crate) fn reply_error(hub: &Hub, conn: &Connection, code: &'static str) {
    reply(hub, conn, &Event::error(code));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, MemoryBus};
    use crate::collaborators::{Collaborators, InMemoryCollaborators};
    use crate::config::Config;
    use crate::websocket::events::EventKind;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        hub: Arc<Hub>,
        store: Arc<InMemoryCollaborators>,
    }

    async fn fixture(config: Config) -> Fixture {
        let store = Arc::new(InMemoryCollaborators::new());
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let hub = Hub::start(config, Some(bus), Collaborators::shared(store.clone())).await;
        Fixture { hub, store }
    }

    async fn connect(hub: &Hub, user: Uuid) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
        let (conn, rx) = Connection::new(user, 64);
        hub.register(conn.clone()).await.unwrap();
        (conn, rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<Arc<str>>) -> Option<Event> {
        let raw = tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .ok()
            .flatten()?;
        Some(serde_json::from_str(&raw).unwrap())
    }

    #[tokio::test]
    async fn malformed_frames_get_error_events() {
        let f = fixture(Config::test_defaults()).await;
        let (conn, mut rx) = connect(&f.hub, Uuid::new_v4()).await;

        handle_text(&f.hub, &conn, "not json").await;
        assert_eq!(
            next_event(&mut rx).await.unwrap().error_code(),
            Some(codes::INVALID_PAYLOAD)
        );

        handle_text(&f.hub, &conn, r#"{"type":"typing","room_id":"nope"}"#).await;
        assert_eq!(
            next_event(&mut rx).await.unwrap().error_code(),
            Some(codes::INVALID_ROOM_ID)
        );

        handle_text(&f.hub, &conn, r#"{"type":"notification:read","data":{}}"#).await;
        assert_eq!(
            next_event(&mut rx).await.unwrap().error_code(),
            Some(codes::INVALID_NOTIFICATION_ID)
        );

        handle_text(&f.hub, &conn, r#"{"type":"future:thing"}"#).await;
        assert!(next_event(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn typing_requires_a_local_subscription() {
        let f = fixture(Config::test_defaults()).await;
        let user = Uuid::new_v4();
        let room = Uuid::new_v4();
        let (conn, mut rx) = connect(&f.hub, user).await;

        let frame = format!(r#"{{"type":"typing","room_id":"{}"}}"#, room);
        handle_text(&f.hub, &conn, &frame).await;
        assert_eq!(
            next_event(&mut rx).await.unwrap().error_code(),
            Some(codes::NOT_SUBSCRIBED)
        );

        f.hub.subscribe_room(room, user);
        handle_text(&f.hub, &conn, &frame).await;
        let event = next_event(&mut rx).await.unwrap();
        assert_eq!(event.kind, EventKind::Typing);
        assert_eq!(event.data.unwrap()["is_typing"], true);
    }

    #[tokio::test]
    async fn read_persists_then_broadcasts() {
        let f = fixture(Config::test_defaults()).await;
        let (reader, watcher) = (Uuid::new_v4(), Uuid::new_v4());
        let room = Uuid::new_v4();
        let (conn, _rx) = connect(&f.hub, reader).await;
        let (_w, mut watcher_rx) = connect(&f.hub, watcher).await;
        f.hub.subscribe_room(room, reader);
        f.hub.subscribe_room(room, watcher);

        let frame = format!(r#"{{"type":"read","room_id":"{}"}}"#, room);
        handle_text(&f.hub, &conn, &frame).await;

        assert_eq!(f.store.read_marks(), vec![(room, reader)]);
        let event = next_event(&mut watcher_rx).await.unwrap();
        assert_eq!(event.kind, EventKind::Read);
        assert_eq!(event.sender_id, Some(reader));
        assert!(event.data.unwrap().contains_key("read_at"));
        assert!(next_event(&mut watcher_rx).await.is_none());
    }

    #[tokio::test]
    async fn general_limit_applies_to_typing() {
        let mut config = Config::test_defaults();
        config.message_rate_limit = 2;
        let f = fixture(config).await;
        let user = Uuid::new_v4();
        let room = Uuid::new_v4();
        let (conn, mut rx) = connect(&f.hub, user).await;
        f.hub.subscribe_room(room, user);

        let frame = format!(r#"{{"type":"typing","room_id":"{}"}}"#, room);
        for _ in 0..3 {
            handle_text(&f.hub, &conn, &frame).await;
        }
        let mut kinds = Vec::new();
        while let Some(event) = next_event(&mut rx).await {
            kinds.push(event.error_code().map(str::to_string));
        }
        assert_eq!(kinds.iter().filter(|k| k.is_none()).count(), 2);
        assert!(kinds.contains(&Some(codes::RATE_LIMITED.to_string())));
    }

    #[tokio::test]
    async fn sync_replies_to_requester_only() {
        let f = fixture(Config::test_defaults()).await;
        let user = Uuid::new_v4();
        f.store.push_notification(user, "like", "someone liked your post");
        let (phone, mut phone_rx) = connect(&f.hub, user).await;
        let (_laptop, mut laptop_rx) = connect(&f.hub, user).await;

        handle_text(&f.hub, &phone, r#"{"type":"notification:sync","data":{"limit":500}}"#).await;

        let event = next_event(&mut phone_rx).await.unwrap();
        assert_eq!(event.kind, EventKind::NotificationSync);
        let data = event.data.unwrap();
        assert_eq!(data["limit"], 50);
        assert_eq!(data["offset"], 0);
        assert_eq!(data["unread_count"], 1);
        assert_eq!(data["items"].as_array().map(|a| a.len()), Some(1));
        assert!(next_event(&mut laptop_rx).await.is_none());
    }

    #[tokio::test]
    async fn read_updates_every_device() {
        let f = fixture(Config::test_defaults()).await;
        let user = Uuid::new_v4();
        let first = f.store.push_notification(user, "like", "a");
        f.store.push_notification(user, "like", "b");
        let (phone, mut phone_rx) = connect(&f.hub, user).await;
        let (_laptop, mut laptop_rx) = connect(&f.hub, user).await;

        let frame = format!(r#"{{"type":"notification:read","data":{{"id":"{}"}}}}"#, first);
        handle_text(&f.hub, &phone, &frame).await;

        for rx in [&mut phone_rx, &mut laptop_rx] {
            let event = next_event(rx).await.unwrap();
            assert_eq!(event.kind, EventKind::NotificationState);
            let data = event.data.unwrap();
            assert_eq!(data["unread_count"], 1);
            assert_eq!(data["read_ids"][0], first.to_string());
        }

        handle_text(&f.hub, &phone, r#"{"type":"notification:read-all"}"#).await;
        let event = next_event(&mut laptop_rx).await.unwrap();
        let data = event.data.unwrap();
        assert_eq!(data["read_all"], true);
        assert_eq!(data["unread_count"], 0);
    }

    #[tokio::test]
    async fn collaborator_failure_is_reported_not_fatal() {
        let f = fixture(Config::test_defaults()).await;
        let (conn, mut rx) = connect(&f.hub, Uuid::new_v4()).await;

        f.store.set_failing(true);
        handle_text(&f.hub, &conn, r#"{"type":"notification:sync"}"#).await;
        assert_eq!(
            next_event(&mut rx).await.unwrap().error_code(),
            Some(codes::INTERNAL_ERROR)
        );

        f.store.set_failing(false);
        handle_text(&f.hub, &conn, r#"{"type":"notification:sync"}"#).await;
        assert_eq!(
            next_event(&mut rx).await.unwrap().kind,
            EventKind::NotificationSync
        );
    }

    #[tokio::test]
    async fn slow_collaborator_hits_the_deadline() {
        let mut config = Config::test_defaults();
        config.collaborator_timeout_ms = 50;
        let f = fixture(config).await;
        let (conn, mut rx) = connect(&f.hub, Uuid::new_v4()).await;

        f.store.set_delay(Some(Duration::from_millis(500)));
        handle_text(&f.hub, &conn, r#"{"type":"notification:read-all"}"#).await;
        assert_eq!(
            next_event(&mut rx).await.unwrap().error_code(),
            Some(codes::INTERNAL_ERROR)
        );
    }
}
