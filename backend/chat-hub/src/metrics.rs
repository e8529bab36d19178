use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

pub static DROPPED_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "chat_hub_dropped_events_total",
        "Outbound events dropped because a connection queue was full",
    )
    .expect("failed to create chat_hub_dropped_events_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_hub_dropped_events_total");
    counter
});

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "chat_hub_active_connections",
        "WebSocket connections registered on this instance",
    )
    .expect("failed to create chat_hub_active_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register chat_hub_active_connections");
    gauge
});

pub static BUS_PUBLISH_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_hub_bus_publish_failures_total",
            "Publishes to the shared bus that failed",
        ),
        &["channel"],
    )
    .expect("failed to create chat_hub_bus_publish_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_hub_bus_publish_failures_total");
    counter
});

pub static BUS_EVENTS_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_hub_bus_events_received_total",
            "Events received from the shared bus subscription",
        ),
        &["channel"],
    )
    .expect("failed to create chat_hub_bus_events_received_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_hub_bus_events_received_total");
    counter
});

pub static RATE_LIMITED_COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_hub_rate_limited_commands_total",
            "Inbound WebSocket commands rejected by a rate limiter",
        ),
        &["command"],
    )
    .expect("failed to create chat_hub_rate_limited_commands_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_hub_rate_limited_commands_total");
    counter
});

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(buffer.into())
        .unwrap_or_else(|err| {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        })
}
