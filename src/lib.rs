pub mod adapters;
pub mod config;
pub mod domain;
pub mod infra;
pub mod services;

use {
    adapters::signature::VerifierRegistry,
    domain::clock::Clock,
    services::pipeline::Pipeline,
    std::{sync::Arc, time::Duration},
};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub registry: Arc<VerifierRegistry>,
    pub clock: Arc<dyn Clock>,
    /// Budget for synchronous processing inside one webhook request.
    pub request_timeout: Duration,
}
