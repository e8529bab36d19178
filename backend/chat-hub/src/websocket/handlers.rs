use super::commands;
use super::message_types::SyncParams;
use super::Connection;
use crate::hub::Hub;
use crate::middleware::auth::{token_from_request, verify_jwt};
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// `GET /ws`: authenticate, then upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = token_from_request(params.token.as_deref(), &headers) else {
        warn!("websocket connection rejected: no token");
        return crate::error::HubError::Unauthorized.into_response();
    };
    let user_id = match verify_jwt(&state.config.jwt_secret, &token) {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!("websocket connection rejected: invalid token");
            return e.into_response();
        }
    };

    let max_bytes = state.config.max_message_bytes;
    let hub = state.hub.clone();
    ws.max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| serve_connection(hub, user_id, socket))
}

/// Drive one connection from registration to teardown.
pub async fn serve_connection(hub: Arc<Hub>, user_id: Uuid, mut socket: WebSocket) {
    let config = hub.config();
    let (conn, outbound) = Connection::new(user_id, config.outbound_queue_capacity);

    let first = match hub.register(conn.clone()).await {
        Ok(first) => first,
        Err(e) => {
            warn!(%user_id, error = %e, "registration refused");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    // Baseline before any loop runs: rooms, then the first sync page.
    let rooms = match hub
        .call_collaborator(hub.collaborators().rooms.list_rooms_for_user(user_id))
        .await
    {
        Ok(rooms) => rooms,
        Err(e) => {
            warn!(%user_id, error = %e, "room lookup failed, connection starts with no rooms");
            Vec::new()
        }
    };
    for room_id in &rooms {
        hub.subscribe_room(*room_id, user_id);
    }
    if first {
        hub.announce_presence(user_id, &rooms, true).await;
    }
    if let Err(code) = commands::send_sync(&hub, &conn, SyncParams::default()).await {
        commands::reply_error(&hub, &conn, code);
    }

    info!(%user_id, connection_id = %conn.id(), rooms = rooms.len(), "websocket connected");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        conn.clone(),
        config.ping_period(),
        config.write_wait(),
    ));

    read_loop(stream, &hub, &conn, config.pong_wait()).await;

    // The reader is the only place teardown starts.
    match hub.unregister(conn.clone()).await {
        Ok(left) if !left.is_empty() => hub.announce_presence(user_id, &left, false).await,
        Ok(_) => {}
        Err(e) => debug!(%user_id, error = %e, "unregister skipped"),
    }
    conn.close();
    if let Err(e) = writer.await {
        warn!(%user_id, error = %e, "writer task failed");
    }
    info!(%user_id, connection_id = %conn.id(), "websocket disconnected");
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    hub: &Hub,
    conn: &Connection,
    pong_wait: Duration,
) {
    let deadline = tokio::time::sleep(pong_wait);
    tokio::pin!(deadline);

    loop {
        let frame = tokio::select! {
            _ = conn.closed() => break,
            _ = &mut deadline => {
                debug!(user_id = %conn.user_id(), "read deadline passed without pong");
                break;
            }
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => commands::handle_text(hub, conn, &text).await,
            Some(Ok(Message::Pong(_))) => {
                deadline.as_mut().reset(Instant::now() + pong_wait);
            }
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Binary(_))) => {
                commands::reply_error(hub, conn, super::events::codes::INVALID_PAYLOAD);
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                // also covers frames over the size cap
                debug!(user_id = %conn.user_id(), error = %e, "websocket read failed");
                break;
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    conn: Arc<Connection>,
    ping_period: Duration,
    write_wait: Duration,
) {
    let mut heartbeat = tokio::time::interval_at(Instant::now() + ping_period, ping_period);

    loop {
        let message = tokio::select! {
            biased;
            _ = conn.closed() => {
                let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
                break;
            }
            payload = outbound.recv() => match payload {
                Some(payload) => Message::Text(payload.to_string()),
                None => break,
            },
            _ = heartbeat.tick() => Message::Ping(Vec::new()),
        };

        match timeout(write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(user_id = %conn.user_id(), error = %e, "websocket write failed");
                break;
            }
            Err(_) => {
                debug!(user_id = %conn.user_id(), "websocket write timed out");
                break;
            }
        }
    }

    // wakes the reader if the writer gave up first
    conn.close();
    let _ = sink.close().await;
}
