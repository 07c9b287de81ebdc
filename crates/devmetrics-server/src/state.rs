use crate::service::MetricsService;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MetricsService>,
}

impl AppState {
    pub fn new(service: Arc<MetricsService>) -> Self {
        Self { service }
    }
}
