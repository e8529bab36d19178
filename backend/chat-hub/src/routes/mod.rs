use crate::metrics::metrics_handler;
use crate::middleware::auth::internal_auth;
use crate::state::AppState;
use crate::websocket::handlers::ws_handler;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};

pub mod internal;

pub fn build_router(state: AppState) -> Router {
    let introspection = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler));

    let internal_api = Router::new()
        .route("/rooms/:room_id/events", post(internal::broadcast_room_event))
        .route("/rooms/:room_id/messages", post(internal::announce_message))
        .route(
            "/rooms/:room_id/messages/:message_id",
            axum::routing::delete(internal::announce_message_deleted),
        )
        .route(
            "/rooms/:room_id/members/:user_id",
            post(internal::subscribe_member).delete(internal::unsubscribe_member),
        )
        .route("/users/:user_id/events", post(internal::send_user_event))
        .route("/presence", post(internal::presence))
        .route_layer(middleware::from_fn_with_state(state.clone(), internal_auth));

    Router::new()
        .merge(introspection)
        .route("/ws", get(ws_handler))
        .nest("/internal", internal_api)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "instance_id": state.hub.instance_id(),
        "bus_subscribed": state.hub.is_bus_subscribed(),
        "connections": state.hub.total_local_connections(),
    }))
}
