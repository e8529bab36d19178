use crate::config::Config;
use crate::hub::Hub;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(hub: Arc<Hub>) -> Self {
        let config = Arc::new(hub.config().clone());
        Self { hub, config }
    }
}
