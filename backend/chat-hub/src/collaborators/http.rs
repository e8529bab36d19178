//! HTTP clients for the chat REST service's internal endpoints.

use super::{NotificationQuery, NotificationWriter, RoomDirectory};
use crate::error::{HubError, HubResult};
use crate::models::NotificationItem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct RoomsResponse {
    room_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct NotificationsResponse {
    #[serde(default)]
    items: Vec<NotificationItem>,
}

#[derive(Debug, Deserialize)]
struct UnreadCountResponse {
    unread_count: i64,
}

#[derive(Debug, Deserialize)]
struct ReadAllResponse {
    #[serde(default)]
    updated: u64,
}

/// Implements every collaborator trait against one base URL.
#[derive(Clone)]
pub struct HttpCollaborators {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpCollaborators {
    pub fn new(base_url: &str, timeout: Duration) -> HubResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HubError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> HubResult<T> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(HubError::Collaborator(format!("{}: {}", status, body)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| HubError::Collaborator(format!("invalid response body: {}", e)))
    }

    fn transport_error(&self, e: reqwest::Error) -> HubError {
        if e.is_timeout() {
            HubError::Timeout(self.timeout)
        } else {
            HubError::Collaborator(format!("request failed: {}", e))
        }
    }

    async fn fetch_unread_count(&self, user_id: Uuid) -> HubResult<i64> {
        let url = self.url(&format!(
            "/internal/users/{}/notifications/unread-count",
            user_id
        ));
        let body: UnreadCountResponse = self.send(self.client.get(url)).await?;
        Ok(body.unread_count)
    }
}

#[async_trait]
impl RoomDirectory for HttpCollaborators {
    async fn list_rooms_for_user(&self, user_id: Uuid) -> HubResult<Vec<Uuid>> {
        let url = self.url(&format!("/internal/users/{}/rooms", user_id));
        let body: RoomsResponse = self.send(self.client.get(url)).await?;
        debug!(%user_id, rooms = body.room_ids.len(), "fetched room memberships");
        Ok(body.room_ids)
    }

    async fn mark_room_read(&self, room_id: Uuid, user_id: Uuid) -> HubResult<DateTime<Utc>> {
        let url = self.url(&format!("/internal/rooms/{}/read", room_id));
        let request = self
            .client
            .post(url)
            .json(&serde_json::json!({ "user_id": user_id }));
        let body: ReadResponse = self.send(request).await?;
        Ok(body.read_at.unwrap_or_else(Utc::now))
    }
}

#[async_trait]
impl NotificationQuery for HttpCollaborators {
    async fn list(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
        unread_only: bool,
    ) -> HubResult<Vec<NotificationItem>> {
        let url = self.url(&format!("/internal/users/{}/notifications", user_id));
        let request = self.client.get(url).query(&[
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
            ("unread_only", unread_only.to_string()),
        ]);
        let body: NotificationsResponse = self.send(request).await?;
        Ok(body.items)
    }

    async fn unread_count(&self, user_id: Uuid) -> HubResult<i64> {
        self.fetch_unread_count(user_id).await
    }
}

#[async_trait]
impl NotificationWriter for HttpCollaborators {
    async fn mark_as_read(&self, user_id: Uuid, notification_id: Uuid) -> HubResult<()> {
        let url = self.url(&format!(
            "/internal/users/{}/notifications/{}/read",
            user_id, notification_id
        ));
        let _: serde_json::Value = self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn mark_all_read(&self, user_id: Uuid) -> HubResult<u64> {
        let url = self.url(&format!(
            "/internal/users/{}/notifications/read-all",
            user_id
        ));
        let body: ReadAllResponse = self.send(self.client.post(url)).await?;
        Ok(body.updated)
    }

    async fn unread_count(&self, user_id: Uuid) -> HubResult<i64> {
        self.fetch_unread_count(user_id).await
    }
}
