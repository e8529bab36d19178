#![allow(dead_code)]

use chat_hub::bus::{Bus, MemoryBus};
use chat_hub::collaborators::{Collaborators, InMemoryCollaborators};
use chat_hub::middleware::auth::{issue_jwt, INTERNAL_TOKEN_HEADER};
use chat_hub::{routes, AppState, Config, Hub};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const JWT_SECRET: &str = "test-secret";
pub const INTERNAL_TOKEN: &str = "internal-test-token";

/// One hub process served on an ephemeral port.
pub struct TestHub {
    pub hub: Arc<Hub>,
    pub store: Arc<InMemoryCollaborators>,
    pub addr: SocketAddr,
}

impl TestHub {
    pub async fn start(bus: Option<Arc<MemoryBus>>) -> Self {
        Self::start_with(Config::test_defaults(), bus, Arc::new(InMemoryCollaborators::new())).await
    }

    pub async fn start_with(
        config: Config,
        bus: Option<Arc<MemoryBus>>,
        store: Arc<InMemoryCollaborators>,
    ) -> Self {
        let hub = Hub::start(
            config,
            bus.map(|b| b as Arc<dyn Bus>),
            Collaborators::shared(store.clone()),
        )
        .await;
        let app = routes::build_router(AppState::new(hub.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { hub, store, addr }
    }

    pub fn ws_url(&self, user_id: Uuid) -> String {
        format!("ws://{}/ws?token={}", self.addr, token(user_id))
    }

    /// Connect and consume the initial `notification:sync`, which the server
    /// sends only after room subscriptions are in place.
    pub async fn connect(&self, user_id: Uuid) -> WsClient {
        let (mut ws, _) = connect_async(self.ws_url(user_id)).await.unwrap();
        let first = next_of_type(&mut ws, "notification:sync").await;
        assert!(first.is_some(), "no initial sync for {user_id}");
        ws
    }

    pub async fn post_internal(&self, path: &str, body: Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("http://{}{}", self.addr, path))
            .header(INTERNAL_TOKEN_HEADER, INTERNAL_TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

pub fn token(user_id: Uuid) -> String {
    issue_jwt(JWT_SECRET, user_id, Duration::from_secs(3600)).unwrap()
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next JSON event, or `None` if nothing arrives within `wait`.
pub async fn next_event_within(ws: &mut WsClient, wait: Duration) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(wait, ws.next()).await.ok()??;
        match frame {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            _ => return None,
        }
    }
}

pub async fn next_event(ws: &mut WsClient) -> Option<Value> {
    next_event_within(ws, Duration::from_secs(2)).await
}

/// Skip events until one of `kind` arrives.
pub async fn next_of_type(ws: &mut WsClient, kind: &str) -> Option<Value> {
    loop {
        let event = next_event(ws).await?;
        if event["type"] == kind {
            return Some(event);
        }
    }
}

/// Everything received within `window`, presence announcements excluded.
pub async fn drain(ws: &mut WsClient, window: Duration) -> Vec<Value> {
    let mut events = Vec::new();
    while let Some(event) = next_event_within(ws, window).await {
        if event["type"] == "online" || event["type"] == "offline" {
            continue;
        }
        events.push(event);
    }
    events
}

pub fn types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e["type"].as_str().map(str::to_string))
        .collect()
}
