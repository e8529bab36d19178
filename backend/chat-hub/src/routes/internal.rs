//! Internal routes used by the services that own rooms, messages and
//! notifications to push domain events through the hub.

use crate::error::{HubError, HubResult};
use crate::models::MessagePayload;
use crate::state::AppState;
use crate::websocket::events::Event;
use crate::websocket::pubsub::RoomDelivery;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

const MAX_PRESENCE_QUERY: usize = 1_000;

#[derive(Debug, Deserialize)]
pub struct DeletedBy {
    pub deleted_by: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct PresenceQuery {
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub online: Vec<Uuid>,
}

fn delivery_body(delivery: RoomDelivery) -> Json<Value> {
    match delivery {
        RoomDelivery::Relayed => Json(json!({ "delivery": "relayed" })),
        RoomDelivery::Local(stats) => Json(json!({
            "delivery": "local",
            "delivered": stats.delivered,
            "dropped": stats.dropped,
        })),
    }
}

pub async fn broadcast_room_event(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(mut event): Json<Event>,
) -> HubResult<Json<Value>> {
    event.room_id.get_or_insert(room_id);
    let delivery = state.hub.broadcast_to_room(room_id, &event).await?;
    Ok(delivery_body(delivery))
}

pub async fn announce_message(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(message): Json<MessagePayload>,
) -> HubResult<StatusCode> {
    if message.room_id != room_id {
        return Err(HubError::BadRequest("message room_id does not match path".into()));
    }
    state.hub.announce_message(room_id, &message).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn announce_message_deleted(
    State(state): State<AppState>,
    Path((room_id, message_id)): Path<(Uuid, Uuid)>,
    Query(by): Query<DeletedBy>,
) -> HubResult<StatusCode> {
    state
        .hub
        .announce_message_deleted(room_id, message_id, by.deleted_by)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn subscribe_member(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(Uuid, Uuid)>,
) -> StatusCode {
    // only meaningful if the user holds a connection here
    if state.hub.local_connection_count(user_id) > 0 {
        state.hub.subscribe_room(room_id, user_id);
    }
    StatusCode::NO_CONTENT
}

pub async fn unsubscribe_member(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(Uuid, Uuid)>,
) -> StatusCode {
    state.hub.unsubscribe_room(room_id, user_id);
    StatusCode::NO_CONTENT
}

pub async fn send_user_event(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(event): Json<Event>,
) -> HubResult<Json<Value>> {
    let stats = state.hub.send_to_user(user_id, &event).await?;
    Ok(Json(json!({
        "delivered_locally": stats.delivered,
        "dropped": stats.dropped,
    })))
}

pub async fn presence(
    State(state): State<AppState>,
    Json(query): Json<PresenceQuery>,
) -> HubResult<Json<PresenceResponse>> {
    if query.user_ids.len() > MAX_PRESENCE_QUERY {
        return Err(HubError::BadRequest(format!(
            "at most {} user ids per query",
            MAX_PRESENCE_QUERY
        )));
    }
    let online = state.hub.online_among(&query.user_ids).await;
    Ok(Json(PresenceResponse { online }))
}
