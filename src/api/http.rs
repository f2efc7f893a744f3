//! Client-facing HTTP surface (spec §6): `/v1/completions`, `/v1/embeddings`,
//! `/v1/models`, `/v1/models/{id}`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use futures_util::StreamExt;
use serde_json::json;
use uuid::Uuid;

use crate::{
    api::auth::ApiKeyIdentity,
    config::FilterDirection,
    content_filter::FilterDirection as FilterDir,
    error::GatewayError,
    model::{split_canonical_id, CompletionRequest, EmbeddingRequest},
    state::AppState,
};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{id}", get(get_model))
        .with_state(state)
}

/// Advisory pre-flight budget check (spec §4.4): only consulted when `budget.enforce` is
/// set, and only against the prompt side of the request — the completion side isn't known
/// until the provider answers, so it's priced and recorded after the fact regardless.
async fn budget_precheck(
    state: &AppState,
    config: &crate::config::Config,
    user_id: Option<&str>,
    model_id: &str,
    text: &str,
) -> Option<GatewayError> {
    if !config.budget.enforce {
        return None;
    }
    let Some(uid) = user_id else { return None };
    let (provider, _) = split_canonical_id(model_id).unwrap_or(("", model_id));
    let prompt_tokens = state.tokenizer.count_tokens(provider, model_id, text).tokens;
    let (prompt_price, _, _) = state.cost.pricing.get(model_id);
    let projected = prompt_tokens as f64 * prompt_price / 1000.0;
    if state.cost.budget_allows(uid, projected) {
        None
    } else {
        Some(GatewayError::BudgetExceeded)
    }
}

async fn completions(
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<ApiKeyIdentity>>,
    Json(request): Json<CompletionRequest>,
) -> Response {
    if let Err(msg) = request.validate() {
        return GatewayError::ProviderBadRequest(msg.to_string()).into_response();
    }
    if let Some(Extension(identity)) = &identity {
        if !identity.allows("completion") {
            return GatewayError::ProviderAuth("api key lacks the `completion` permission".into())
                .into_response();
        }
    }

    let user_id = identity.as_ref().map(|Extension(i)| i.user_id.clone());
    let api_key = user_id.clone().unwrap_or_else(|| "anonymous".to_string());
    let request_id = Uuid::new_v4().to_string();

    let config = crate::config::current(&state.config);

    if config.content_filter.enabled && config.content_filter.directions.contains(&FilterDirection::Prompt) {
        let result = state.content_filter.check(&request.joined_text(), FilterDir::Prompt).await;
        if !result.allowed {
            return GatewayError::ContentBlocked(result.reason.unwrap_or_else(|| "prompt blocked".into()))
                .into_response();
        }
    }

    if let Some(err) =
        budget_precheck(&state, &config, user_id.as_deref(), &request.model_id, &request.joined_text()).await
    {
        return err.into_response();
    }

    let (candidates, _decision) = match state.router.route(&request.model_id, &request, None).await {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };

    if request.stream {
        let chunks = Arc::clone(&state.dispatcher).dispatch_stream(api_key, user_id, request_id, request, candidates);

        let events = chunks
            .map(|item| match item {
                Ok(chunk) => Event::default()
                    .json_data(&chunk)
                    .unwrap_or_else(|_| Event::default().data("{}")),
                Err(e) => Event::default()
                    .event("error")
                    .json_data(&json!({ "errorCode": e.error_code(), "message": e.to_string() }))
                    .unwrap_or_else(|_| Event::default().data("{}")),
            })
            .map(Ok::<_, Infallible>)
            .chain(futures_util::stream::once(async { Ok(Event::default().data("[DONE]")) }));

        return Sse::new(events).into_response();
    }

    match state.dispatcher.dispatch(&api_key, user_id.as_deref(), &request_id, &request, &candidates).await {
        Ok(response) => {
            if config.content_filter.enabled && config.content_filter.directions.contains(&FilterDirection::Completion)
            {
                let text = response
                    .choices
                    .iter()
                    .filter_map(|c| c.message.content.as_deref())
                    .collect::<Vec<_>>()
                    .join("\n");
                let result = state.content_filter.check(&text, FilterDir::Completion).await;
                if !result.allowed {
                    return GatewayError::ContentBlocked(
                        result.reason.unwrap_or_else(|| "completion blocked".into()),
                    )
                    .into_response();
                }
            }
            Json(response).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<ApiKeyIdentity>>,
    Json(request): Json<EmbeddingRequest>,
) -> Response {
    if request.input.is_empty() {
        return GatewayError::ProviderBadRequest("input must be non-empty".into()).into_response();
    }
    if let Some(Extension(identity)) = &identity {
        if !identity.allows("embedding") {
            return GatewayError::ProviderAuth("api key lacks the `embedding` permission".into())
                .into_response();
        }
    }

    let user_id = identity.as_ref().map(|Extension(i)| i.user_id.clone());
    let api_key = user_id.clone().unwrap_or_else(|| "anonymous".to_string());
    let request_id = Uuid::new_v4().to_string();

    let config = crate::config::current(&state.config);
    let joined = request.input.join("\n");
    if let Some(err) = budget_precheck(&state, &config, user_id.as_deref(), &request.model_id, &joined).await {
        return err.into_response();
    }

    let (candidates, _decision) = match state.router.route_embedding(&request.model_id, &request).await {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };

    match state
        .dispatcher
        .dispatch_embedding(&api_key, user_id.as_deref(), &request_id, &request, &candidates)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let config = crate::config::current(&state.config);
    Json(json!({ "data": config.all_models() })).into_response()
}

async fn get_model(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let config = crate::config::current(&state.config);
    match config.all_models().into_iter().find(|m| m.id == id) {
        Some(descriptor) => Json(descriptor).into_response(),
        None => GatewayError::NoSuchModel(id).into_response(),
    }
}
