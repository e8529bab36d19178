use super::{Bus, BusMessage, BusStream};
use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis_utils::RedisPool;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// [`Bus`] backed by Redis pub/sub and a Redis set for presence.
#[derive(Clone)]
pub struct RedisBus {
    pool: RedisPool,
    op_timeout: Duration,
}

impl RedisBus {
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// A hung connection counts as an unavailable bus, not a stalled caller.
    async fn bounded<T, F>(&self, op: &str, fut: F) -> HubResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(HubError::from),
            Err(_) => Err(HubError::BusUnavailable(format!(
                "redis {} timed out after {:?}",
                op, self.op_timeout
            ))),
        }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> HubResult<()> {
        let mut conn = self.pool.manager();
        let _receivers: i64 = self
            .bounded("PUBLISH", conn.publish(channel, payload))
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str], patterns: &[&str]) -> HubResult<BusStream> {
        let mut pubsub = self
            .pool
            .pubsub()
            .await
            .map_err(|e| HubError::BusUnavailable(e.to_string()))?;

        for channel in channels {
            pubsub.subscribe(*channel).await?;
        }
        for pattern in patterns {
            pubsub.psubscribe(*pattern).await?;
        }

        tracing::info!(
            redis = %self.pool.addr_label(),
            ?channels,
            ?patterns,
            "subscribed to shared bus"
        );

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(BusMessage { channel, payload }),
                    Err(e) => {
                        tracing::warn!(%channel, error = %e, "dropping non-text bus payload");
                        None
                    }
                }
            })
            .boxed();

        Ok(stream)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> HubResult<()> {
        let mut conn = self.pool.manager();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SADD")
            .arg(key)
            .arg(member)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .ignore();
        self.bounded("SADD", pipe.query_async::<_, ()>(&mut conn))
            .await
    }

    async fn set_remove(&self, key: &str, member: &str) -> HubResult<()> {
        let mut conn = self.pool.manager();
        let _removed: i64 = self.bounded("SREM", conn.srem(key, member)).await?;
        Ok(())
    }

    async fn set_contains(&self, key: &str, members: &[String]) -> HubResult<Vec<bool>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.manager();
        let mut cmd = redis::cmd("SMISMEMBER");
        cmd.arg(key).arg(members);
        self.bounded("SMISMEMBER", cmd.query_async::<_, Vec<bool>>(&mut conn))
            .await
    }
}
