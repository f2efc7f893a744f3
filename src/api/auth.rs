//! Client API authentication (spec §6: "requests carry either `Authorization: Bearer
//! <JWT>` or `X-API-Key: <key>`. At least one must validate. Authorization claims gate
//! operations.").
//!
//! JWT signature verification is explicitly out of scope (SPEC_FULL.md §12 Open Question
//! 4) — the spec treats authentication as an external collaborator and only requires that
//! a valid credential resolve to claims. This middleware reduces that to a lookup against
//! the configured `[[clients]]` key map: each entry's `key_env` names an environment
//! variable holding the actual secret, and `permissions` are the claims gating operations.
//! An empty `clients` list disables auth entirely, same as the base repository's
//! client-map-empty no-op.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

/// Claims attached to the request once a key is matched, consulted by handlers to gate
/// individual operations (e.g. an embeddings-only key hitting `/v1/completions`).
#[derive(Clone, Debug)]
pub struct ApiKeyIdentity {
    pub user_id: String,
    pub permissions: Vec<String>,
}

impl ApiKeyIdentity {
    pub fn allows(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

fn extract_key(req: &Request) -> Option<String> {
    if let Some(header) = req.headers().get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    req.headers().get("x-api-key").and_then(|v| v.to_str().ok()).map(str::to_string)
}

pub async fn client_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let config = crate::config::current(&state.config);
    if config.clients.is_empty() {
        return next.run(req).await;
    }

    let Some(provided) = extract_key(&req) else {
        return unauthorized();
    };

    let matched = config
        .clients
        .iter()
        .find(|c| std::env::var(&c.key_env).map(|v| v == provided).unwrap_or(false));

    match matched {
        Some(client) => {
            req.extensions_mut().insert(ApiKeyIdentity {
                user_id: client.user_id.clone(),
                permissions: client.permissions.clone(),
            });
            next.run(req).await
        }
        None => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer realm=\"llm-gateway\"")],
        "requests must carry a valid Authorization: Bearer <key> or X-API-Key: <key>",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};

    use axum::{body::Body, http::Request as HttpRequest, routing::get, Router};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        circuit::CircuitRegistry,
        config::{ClientConfig, Config},
        content_filter::PermissiveFilter,
        cost::{CostPipeline, InMemoryBudget, InMemoryUsageRepository, PricingTable},
        dispatcher::Dispatcher,
        rate_limit::RateLimiter,
        router::Router as GatewayRouter,
        tokenizer::DefaultTokenizer,
        traffic::TrafficLog,
    };

    fn state_with_clients(clients: Vec<ClientConfig>) -> Arc<AppState> {
        let config = Config { clients, ..Default::default() };
        let config: crate::config::ConfigHandle = Arc::new(RwLock::new(Arc::new(config)));
        let circuits = Arc::new(CircuitRegistry::new(5, std::time::Duration::from_secs(30)));
        let router = Arc::new(GatewayRouter::new(Arc::clone(&config), Arc::clone(&circuits)));
        let rate_limiter = Arc::new(RateLimiter::new(100, 10, 1, 50));
        let pricing = PricingTable::from_config(&crate::config::current(&config));
        let cost = Arc::new(CostPipeline::new(
            pricing,
            Arc::new(InMemoryUsageRepository::new()),
            Arc::new(InMemoryBudget::from_config(&crate::config::current(&config).budget)),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&config),
            Arc::clone(&circuits),
            rate_limiter,
            Arc::clone(&router),
            Arc::clone(&cost),
            Arc::new(DefaultTokenizer),
            Arc::new(PermissiveFilter),
        ));
        Arc::new(AppState {
            config,
            router,
            dispatcher,
            circuits,
            cost,
            content_filter: Arc::new(PermissiveFilter),
            tokenizer: Arc::new(DefaultTokenizer),
            traffic: Arc::new(TrafficLog::new(10)),
            admin_token: None,
            started_at: tokio::time::Instant::now(),
        })
    }

    async fn probe() -> &'static str {
        "ok"
    }

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/probe", get(probe))
            .layer(axum::middleware::from_fn_with_state(state.clone(), client_auth_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn empty_client_list_disables_auth() {
        let state = state_with_clients(vec![]);
        let resp = app(state)
            .oneshot(HttpRequest::builder().uri("/probe").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_credential_is_rejected() {
        let state = state_with_clients(vec![ClientConfig {
            key_env: "LMG_TEST_AUTH_KEY_1".into(),
            user_id: "alice".into(),
            permissions: vec!["completion".into()],
        }]);
        let resp = app(state)
            .oneshot(HttpRequest::builder().uri("/probe").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_bearer_token_is_admitted() {
        std::env::set_var("LMG_TEST_AUTH_KEY_2", "s3cret");
        let state = state_with_clients(vec![ClientConfig {
            key_env: "LMG_TEST_AUTH_KEY_2".into(),
            user_id: "bob".into(),
            permissions: vec!["completion".into()],
        }]);
        let resp = app(state)
            .oneshot(
                HttpRequest::builder()
                    .uri("/probe")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        std::env::remove_var("LMG_TEST_AUTH_KEY_2");
    }

    #[tokio::test]
    async fn valid_x_api_key_header_is_admitted() {
        std::env::set_var("LMG_TEST_AUTH_KEY_3", "topsecret");
        let state = state_with_clients(vec![ClientConfig {
            key_env: "LMG_TEST_AUTH_KEY_3".into(),
            user_id: "carol".into(),
            permissions: vec!["embedding".into()],
        }]);
        let resp = app(state)
            .oneshot(
                HttpRequest::builder()
                    .uri("/probe")
                    .header("x-api-key", "topsecret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        std::env::remove_var("LMG_TEST_AUTH_KEY_3");
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        std::env::set_var("LMG_TEST_AUTH_KEY_4", "right-key");
        let state = state_with_clients(vec![ClientConfig {
            key_env: "LMG_TEST_AUTH_KEY_4".into(),
            user_id: "dave".into(),
            permissions: vec!["completion".into()],
        }]);
        let resp = app(state)
            .oneshot(
                HttpRequest::builder()
                    .uri("/probe")
                    .header(header::AUTHORIZATION, "Bearer wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        std::env::remove_var("LMG_TEST_AUTH_KEY_4");
    }

    #[test]
    fn allows_checks_membership() {
        let identity = ApiKeyIdentity { user_id: "x".into(), permissions: vec!["completion".into()] };
        assert!(identity.allows("completion"));
        assert!(!identity.allows("embedding"));
    }
}
