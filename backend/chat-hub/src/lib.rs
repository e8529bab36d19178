//! Real-time fan-out hub for chat and notification events.
//!
//! Each process keeps its own WebSocket connections and local room
//! subscriptions; a shared pub/sub bus relays events between processes.

pub mod bus;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod presence;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{HubError, HubResult};
pub use hub::Hub;
pub use state::AppState;
