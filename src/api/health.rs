//! Liveness/readiness surface. Absorbs the base repository's separate public-status
//! endpoint: client-facing health reporting never needs a second shape, just one that's
//! careful not to leak backend/tier names to unauthenticated callers.

use std::sync::Arc;

use axum::{extract::State, response::Json};
use serde_json::json;

use crate::state::AppState;

pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let config = crate::config::current(&state.config);

    let mut missing_api_key = Vec::new();
    let mut open_circuits = Vec::new();
    for (name, provider) in config.providers.iter() {
        if provider.api_key_env.is_some() && provider.api_key().is_none() {
            missing_api_key.push(name.clone());
        }
        if state.circuits.is_open(name) {
            open_circuits.push(name.clone());
        }
    }
    missing_api_key.sort();
    open_circuits.sort();

    let ready = !config.providers.is_empty() && missing_api_key.len() < config.providers.len();

    Json(json!({
        "status": "ok",
        "ready": ready,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "providersConfigured": config.providers.len(),
        "providersMissingApiKey": missing_api_key,
        "openCircuits": open_circuits,
    }))
}
