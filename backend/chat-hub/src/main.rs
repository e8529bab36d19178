use anyhow::Context;
use chat_hub::bus::{Bus, RedisBus};
use chat_hub::collaborators::{Collaborators, HttpCollaborators};
use chat_hub::{logging, routes, AppState, Config, Hub};
use redis_utils::{redact_url, RedisPool};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    logging::init_tracing(config.log_json);

    let bus: Option<Arc<dyn Bus>> = match config.redis_url.as_deref() {
        Some(url) => {
            tracing::info!(redis_url = %redact_url(url), "connecting to shared bus");
            let pool = RedisPool::connect(url)
                .await
                .context("failed to connect to the shared bus")?;
            Some(Arc::new(RedisBus::new(pool)))
        }
        None => {
            tracing::warn!("CHAT_HUB_REDIS_URL not set; events will not cross instances");
            None
        }
    };

    let http = HttpCollaborators::new(
        &config.collaborator_base_url,
        config.collaborator_timeout(),
    )?;
    let collaborators = Collaborators::shared(Arc::new(http));

    let addr = format!("{}:{}", config.host, config.port);
    let hub = Hub::start(config, bus, collaborators).await;
    let app = routes::build_router(AppState::new(hub.clone()));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, instance_id = %hub.instance_id(), "chat-hub listening");

    let shutdown_hub = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                return;
            }
            tracing::info!("shutdown signal received");
            shutdown_hub.shutdown().await;
        })
        .await
        .context("server error")?;

    Ok(())
}
