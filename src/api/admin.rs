//! Admin API (port `gateway.admin_port`) — operator-facing introspection endpoints.
//!
//! Separated onto its own port so it can be network-restricted independently of the
//! client API (e.g. reachable only from an internal network, never exposed publicly).

use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{backends::BackendClient, state::AppState};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/traffic", get(traffic))
        .route("/admin/config", get(config))
        .route("/admin/backends/health", get(backends_health))
        .layer(from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

/// Requires a valid `Authorization: Bearer <token>` when `state.admin_token` is set; a
/// `None` token disables admin auth (acceptable only behind a firewalled admin port).
pub async fn admin_auth_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(expected) = &state.admin_token else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected.as_str() => next.run(req).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"llm-gateway admin\"")],
            "invalid admin token",
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"llm-gateway admin\"")],
            "admin API requires Authorization: Bearer <token>",
        )
            .into_response(),
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = crate::config::current(&state.config);
    Json(json!({
        "status": "ok",
        "providers": config.providers.len(),
        "clients": config.clients.len(),
    }))
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

pub async fn traffic(State(state): State<Arc<AppState>>, Query(q): Query<TrafficQuery>) -> impl IntoResponse {
    let entries = state.traffic.recent(q.limit).await;
    let stats = state.traffic.stats().await;
    Json(json!({ "stats": stats, "entries": entries }))
}

/// Returns the current config with secrets redacted — env var names are shown, resolved
/// values never are.
pub async fn config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cfg = crate::config::current(&state.config);

    let providers: Value = cfg
        .providers
        .iter()
        .map(|(name, p)| {
            (
                name.clone(),
                json!({
                    "base_url": p.base_url,
                    "api_key_env": p.api_key_env,
                    "api_key_present": p.api_key().is_some(),
                    "models": p.models.iter().map(|m| &m.id).collect::<Vec<_>>(),
                }),
            )
        })
        .collect::<serde_json::Map<_, _>>()
        .into();

    let clients: Vec<Value> = cfg
        .clients
        .iter()
        .map(|c| json!({ "key_env": c.key_env, "user_id": c.user_id, "permissions": c.permissions }))
        .collect();

    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "traffic_log_capacity": cfg.gateway.traffic_log_capacity,
        },
        "routing": { "strategy": cfg.routing.strategy },
        "providers": providers,
        "clients": clients,
    }))
}

/// Probes every configured provider's health endpoint.
pub async fn backends_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = crate::config::current(&state.config);
    let mut results = Vec::new();

    for (name, provider_cfg) in config.providers.iter() {
        let client = match BackendClient::new(name, provider_cfg) {
            Ok(c) => c,
            Err(e) => {
                results.push(json!({ "provider": name, "status": "error", "error": e.to_string() }));
                continue;
            }
        };

        let status = if client.is_available().await { "ok" } else { "unreachable" };
        results.push(json!({
            "provider": name,
            "status": status,
            "circuit": format!("{:?}", state.circuits.state_of(name)),
        }));
    }

    let all_ok = results.iter().all(|r| r["status"] == "ok");
    let status = if all_ok { StatusCode::OK } else { StatusCode::MULTI_STATUS };

    (status, Json(json!({ "providers": results })))
}
