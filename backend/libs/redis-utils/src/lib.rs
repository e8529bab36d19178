use anyhow::{Context, Result};
use redis::aio::{ConnectionManager, PubSub};
use redis::{Client, ConnectionAddr, ConnectionInfo, IntoConnectionInfo};
use tokio::time::{timeout, Duration};
use tracing::info;

/// Upper bound on the initial connection handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis handles shared by a service: one multiplexed command connection
/// plus the client needed to open dedicated pub/sub connections.
///
/// Pub/sub cannot run over the multiplexed connection, so every subscriber
/// asks for its own via [`RedisPool::pubsub`].
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    manager: ConnectionManager,
    addr_label: String,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let info: ConnectionInfo = redis_url
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;
        let addr_label = addr_label(&info.addr);

        let client = Client::open(info).context("failed to construct Redis client")?;
        let manager = timeout(CONNECT_TIMEOUT, ConnectionManager::new(client.clone()))
            .await
            .context("timed out connecting to Redis")?
            .context("failed to initialize Redis connection manager")?;

        info!(redis = %addr_label, "Redis connection manager ready");

        Ok(Self {
            client,
            manager,
            addr_label,
        })
    }

    /// Cheap clone of the multiplexed command connection.
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Open a dedicated connection in pub/sub mode.
    pub async fn pubsub(&self) -> Result<PubSub> {
        timeout(CONNECT_TIMEOUT, self.client.get_async_pubsub())
            .await
            .context("timed out opening Redis pub/sub connection")?
            .context("failed to open Redis pub/sub connection")
    }

    /// `host:port` of the server, safe to log (no credentials).
    pub fn addr_label(&self) -> &str {
        &self.addr_label
    }
}

fn addr_label(addr: &ConnectionAddr) -> String {
    match addr {
        ConnectionAddr::Tcp(host, port) => format!("{}:{}", host, port),
        ConnectionAddr::TcpTls { host, port, .. } => format!("{}:{} (tls)", host, port),
        ConnectionAddr::Unix(path) => format!("unix:{}", path.display()),
        #[allow(unreachable_patterns)]
        _ => "redis".to_string(),
    }
}

/// Strip the password from a Redis URL before it goes into a log line.
pub fn redact_url(raw: &str) -> String {
    let Some((scheme, rest)) = raw.split_once("://") else {
        return raw.to_string();
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            if user.is_empty() {
                format!("{}://***@{}", scheme, host)
            } else {
                format!("{}://{}:***@{}", scheme, user, host)
            }
        }
        None => raw.to_string(),
    }
}
