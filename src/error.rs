//! Domain error classes (spec §7) plus a catch-all wrapper for anything that escapes
//! classification, in the style of the base repository's `AppError`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

/// Error classes consulted by the dispatcher's fallback/retry logic. These are intentionally
/// *not* transport-specific — HTTP status codes are derived from the class, not the other way
/// around.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Network I/O, HTTP 408/429/5xx (except 501), read-timeout. Retried within the same
    /// candidate before the dispatcher gives up on it.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// 4xx other than 401/403/404/408/429. Not retried on the same candidate; fallback eligible.
    #[error("provider rejected request: {0}")]
    ProviderBadRequest(String),

    /// 401/403 from the provider. Circuit-independent, surfaced, never falls back
    /// (it's a misconfiguration, not a transient outage).
    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),

    /// 404 from the provider, or an unknown canonical/alias id. Fallback eligible.
    #[error("no such model: {0}")]
    NoSuchModel(String),

    /// No candidate in the sequence satisfies the request's capability requirements.
    #[error("no viable model for this request")]
    NoViableModel,

    /// Local rate-limit bucket denial. Terminal — it's the caller's quota, not a backend fault.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// Projected cost would exceed the configured budget. Terminal, non-retryable.
    #[error("budget exceeded")]
    BudgetExceeded,

    /// Content filter rejected the prompt or the completion. Terminal.
    #[error("content blocked: {0}")]
    ContentBlocked(String),

    /// Every remaining candidate's provider circuit was open. Surfaced only once no
    /// candidates remain.
    #[error("all providers open")]
    AllProvidersOpen,

    /// Fallback depth or candidate list was exhausted without success.
    #[error("all candidates exhausted: {0}")]
    AllCandidatesExhausted(String),

    /// The inbound request was cancelled by the caller. No usage record is emitted for this.
    #[error("request cancelled")]
    Cancelled,

    /// Invariant violation — logged with its id for correlation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Transient(_) => "TRANSIENT",
            GatewayError::ProviderBadRequest(_) => "PROVIDER_BAD_REQUEST",
            GatewayError::ProviderAuth(_) => "PROVIDER_AUTH",
            GatewayError::NoSuchModel(_) => "NO_SUCH_MODEL",
            GatewayError::NoViableModel => "NO_VIABLE_MODEL",
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::BudgetExceeded => "BUDGET_EXCEEDED",
            GatewayError::ContentBlocked(_) => "CONTENT_BLOCKED",
            GatewayError::AllProvidersOpen => "ALL_PROVIDERS_OPEN",
            GatewayError::AllCandidatesExhausted(_) => "ALL_CANDIDATES_EXHAUSTED",
            GatewayError::Cancelled => "CANCELLED",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Transient(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ProviderBadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ProviderAuth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NoSuchModel(_) | GatewayError::NoViableModel => StatusCode::NOT_FOUND,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BudgetExceeded => StatusCode::FORBIDDEN,
            GatewayError::ContentBlocked(_) => StatusCode::FORBIDDEN,
            GatewayError::AllProvidersOpen | GatewayError::AllCandidatesExhausted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Cancelled => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this class is eligible for the dispatcher's fallback cascade.
    pub fn fallback_eligible(&self) -> bool {
        matches!(
            self,
            GatewayError::Transient(_)
                | GatewayError::ProviderBadRequest(_)
                | GatewayError::NoSuchModel(_)
        )
    }

    /// Whether a failed attempt on the *same* candidate should be retried.
    pub fn retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let error_id = Uuid::new_v4().to_string();
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error_id, error = %self, "gateway error");
        } else {
            tracing::warn!(error_id, error = %self, "gateway error");
        }

        let mut body = json!({
            "errorCode": self.error_code(),
            "message": self.to_string(),
            "errorId": error_id,
        });
        if let GatewayError::RateLimitExceeded { retry_after_secs } = &self {
            body["retryAfter"] = json!(retry_after_secs);
        }
        (status, Json(body)).into_response()
    }
}

/// Catch-all wrapper for anything that escapes classification — mirrors the base
/// repository's `AppError`. Always renders as 500; classified errors should be returned as
/// `GatewayError` directly so their real status code is preserved.
pub struct AppError(anyhow::Error);

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let error_id = Uuid::new_v4().to_string();
        tracing::error!(error_id, error = %self.0, "unhandled error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "errorCode": "INTERNAL",
                "message": "internal error",
                "errorId": error_id,
            })),
        )
            .into_response()
    }
}
