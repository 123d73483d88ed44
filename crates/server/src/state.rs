use std::sync::Arc;

use skaldi_player::Manager;
use skaldi_resolver::Resolver;

use crate::broadcast::Broadcaster;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub player: Arc<Manager>,
    pub resolver: Arc<Resolver>,
    pub broadcaster: Arc<Broadcaster>,
    /// Short-timeout client for the suggestion proxy.
    pub http: reqwest::Client,
}
