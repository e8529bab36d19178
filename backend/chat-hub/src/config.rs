use crate::error::HubError;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// Runtime configuration, read from `CHAT_HUB_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared bus. When unset the hub runs in local-only mode.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub jwt_secret: String,
    /// Token expected in `x-internal-token` on the internal routes.
    #[serde(default)]
    pub internal_token: String,
    #[serde(default = "Uuid::new_v4")]
    pub instance_id: Uuid,
    #[serde(default = "default_collaborator_base_url")]
    pub collaborator_base_url: String,
    #[serde(default = "default_collaborator_timeout_ms")]
    pub collaborator_timeout_ms: u64,

    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_presence_ttl_secs")]
    pub presence_ttl_secs: u64,

    #[serde(default = "default_message_rate_limit")]
    pub message_rate_limit: usize,
    #[serde(default = "default_rate_window_secs")]
    pub message_rate_window_secs: u64,
    #[serde(default = "default_notification_sync_limit")]
    pub notification_sync_limit: usize,
    #[serde(default = "default_rate_window_secs")]
    pub notification_sync_window_secs: u64,
    #[serde(default = "default_notification_read_limit")]
    pub notification_read_limit: usize,
    #[serde(default = "default_rate_window_secs")]
    pub notification_read_window_secs: u64,

    #[serde(default)]
    pub log_json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8085
}

fn default_collaborator_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_collaborator_timeout_ms() -> u64 {
    3_000
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_write_wait_secs() -> u64 {
    10
}

fn default_pong_wait_secs() -> u64 {
    60
}

fn default_max_message_bytes() -> usize {
    8 * 1024
}

fn default_presence_ttl_secs() -> u64 {
    300
}

fn default_message_rate_limit() -> usize {
    30
}

fn default_rate_window_secs() -> u64 {
    10
}

fn default_notification_sync_limit() -> usize {
    6
}

fn default_notification_read_limit() -> usize {
    20
}

impl Config {
    pub fn from_env() -> Result<Self, HubError> {
        dotenvy::dotenv().ok();
        let cfg: Config = envy::prefixed("CHAT_HUB_")
            .from_env()
            .map_err(|e| HubError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), HubError> {
        if self.jwt_secret.trim().is_empty() {
            return Err(HubError::Config("CHAT_HUB_JWT_SECRET missing".into()));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(HubError::Config(
                "outbound_queue_capacity must be positive".into(),
            ));
        }
        if self.presence_ttl_secs == 0 {
            return Err(HubError::Config("presence_ttl_secs must be positive".into()));
        }
        if self.pong_wait_secs < 2 || self.write_wait_secs == 0 {
            return Err(HubError::Config(
                "pong_wait_secs must be >= 2 and write_wait_secs > 0".into(),
            ));
        }
        let windows = [
            self.message_rate_window_secs,
            self.notification_sync_window_secs,
            self.notification_read_window_secs,
        ];
        let limits = [
            self.message_rate_limit,
            self.notification_sync_limit,
            self.notification_read_limit,
        ];
        if windows.contains(&0) || limits.contains(&0) {
            return Err(HubError::Config(
                "rate limits and windows must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Heartbeats go out at 9/10 of the peer's read timeout.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    pub fn test_defaults() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            redis_url: None,
            jwt_secret: "test-secret".into(),
            internal_token: "internal-test-token".into(),
            instance_id: Uuid::new_v4(),
            collaborator_base_url: default_collaborator_base_url(),
            collaborator_timeout_ms: 1_000,
            outbound_queue_capacity: default_outbound_queue_capacity(),
            write_wait_secs: default_write_wait_secs(),
            pong_wait_secs: default_pong_wait_secs(),
            max_message_bytes: default_max_message_bytes(),
            presence_ttl_secs: default_presence_ttl_secs(),
            message_rate_limit: default_message_rate_limit(),
            message_rate_window_secs: default_rate_window_secs(),
            notification_sync_limit: default_notification_sync_limit(),
            notification_sync_window_secs: default_rate_window_secs(),
            notification_read_limit: default_notification_read_limit(),
            notification_read_window_secs: default_rate_window_secs(),
            log_json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_period_is_nine_tenths_of_pong_wait() {
        let cfg = Config::test_defaults();
        assert_eq!(cfg.ping_period(), Duration::from_secs(54));
    }

    #[test]
    fn validate_rejects_missing_secret() {
        let mut cfg = Config::test_defaults();
        cfg.jwt_secret = "  ".into();
        assert!(matches!(cfg.validate(), Err(HubError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut cfg = Config::test_defaults();
        cfg.notification_sync_window_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn serde_defaults_fill_missing_fields() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "jwt_secret": "s3cret"
        }))
        .unwrap();
        assert_eq!(cfg.port, 8085);
        assert_eq!(cfg.outbound_queue_capacity, 256);
        assert_eq!(cfg.notification_sync_limit, 6);
        assert!(cfg.redis_url.is_none());
        assert!(cfg.validate().is_ok());
    }
}
