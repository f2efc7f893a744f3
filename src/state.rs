//! Shared application state handed to every HTTP handler on both ports.
//!
//! Construction happens once in `main.rs`; everything here is `Arc`-wrapped so handlers
//! clone cheaply and never block each other (spec §5).

use std::sync::Arc;

use tokio::time::Instant;

use crate::{
    circuit::CircuitRegistry, config::ConfigHandle, content_filter::ContentFilter,
    cost::CostPipeline, dispatcher::Dispatcher, router::Router, tokenizer::TokenizerPort,
    traffic::TrafficLog,
};

pub struct AppState {
    pub config: ConfigHandle,
    pub router: Arc<Router>,
    pub dispatcher: Arc<Dispatcher>,
    pub circuits: Arc<CircuitRegistry>,
    pub cost: Arc<CostPipeline>,
    pub content_filter: Arc<dyn ContentFilter>,
    pub tokenizer: Arc<dyn TokenizerPort>,
    pub traffic: Arc<TrafficLog>,
    /// Bearer token gating the admin port. `None` disables admin auth (firewalled deployments).
    pub admin_token: Option<String>,
    pub started_at: Instant,
}
