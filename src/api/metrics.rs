//! Prometheus-compatible `/metrics` endpoint.
//!
//! Request-shape metrics (`lmg_requests`, `lmg_latency_ms_*`) are derived from the
//! in-memory traffic ring buffer, so they represent a **sliding window** of recent
//! requests rather than lifetime counters — `TYPE gauge` throughout for accuracy, values
//! may decrease as old entries rotate out. Usage/cost counters come from the cost
//! pipeline's lifetime atomics instead, since those must survive the window.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::state::AppState;

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries = state.traffic.recent(usize::MAX).await;

    let window_size = entries.len();
    let mut fallbacks: u64 = 0;
    let mut errors: u64 = 0;

    // (provider, model, success) -> count
    let mut request_counts: HashMap<(String, String, bool), u64> = HashMap::new();
    // (provider, model) -> (latency_sum_ms, count)
    let mut latency: HashMap<(String, String), (u64, u64)> = HashMap::new();

    for e in &entries {
        if e.fallback_depth > 0 {
            fallbacks += 1;
        }
        if !e.success {
            errors += 1;
        }
        *request_counts.entry((e.provider.clone(), e.model.clone(), e.success)).or_default() += 1;
        let lat = latency.entry((e.provider.clone(), e.model.clone())).or_default();
        lat.0 += e.latency_ms;
        lat.1 += 1;
    }

    let (lifetime_requests, lifetime_tokens, lifetime_cost_usd) = state.cost.counters.snapshot();

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP lmg_window_size Number of requests currently held in the traffic ring buffer.\n");
    out.push_str("# TYPE lmg_window_size gauge\n");
    out.push_str(&format!("lmg_window_size {window_size}\n\n"));

    out.push_str("# HELP lmg_requests Request count in the current window, labelled by provider, model, and outcome.\n");
    out.push_str("# TYPE lmg_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((provider, model, success), count) in req_rows {
        let success_str = if *success { "true" } else { "false" };
        out.push_str(&format!(
            "lmg_requests{{provider=\"{provider}\",model=\"{model}\",success=\"{success_str}\"}} {count}\n"
        ));
    }
    out.push('\n');

    out.push_str("# HELP lmg_latency_ms_sum Sum of request latency (ms) in the current window, grouped by provider and model.\n");
    out.push_str("# TYPE lmg_latency_ms_sum gauge\n");
    out.push_str("# HELP lmg_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE lmg_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((provider, model), (sum, count)) in lat_rows {
        out.push_str(&format!("lmg_latency_ms_sum{{provider=\"{provider}\",model=\"{model}\"}} {sum}\n"));
        out.push_str(&format!("lmg_latency_ms_count{{provider=\"{provider}\",model=\"{model}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP lmg_fallbacks_total Requests that required at least one fallback hop in the current window.\n");
    out.push_str("# TYPE lmg_fallbacks_total gauge\n");
    out.push_str(&format!("lmg_fallbacks_total {fallbacks}\n\n"));

    out.push_str("# HELP lmg_errors_total Requests that returned an error in the current window.\n");
    out.push_str("# TYPE lmg_errors_total gauge\n");
    out.push_str(&format!("lmg_errors_total {errors}\n\n"));

    out.push_str("# HELP lmg_requests_lifetime_total Lifetime successfully-priced requests recorded by the cost pipeline.\n");
    out.push_str("# TYPE lmg_requests_lifetime_total counter\n");
    out.push_str(&format!("lmg_requests_lifetime_total {lifetime_requests}\n\n"));

    out.push_str("# HELP lmg_tokens_lifetime_total Lifetime token count recorded by the cost pipeline.\n");
    out.push_str("# TYPE lmg_tokens_lifetime_total counter\n");
    out.push_str(&format!("lmg_tokens_lifetime_total {lifetime_tokens}\n\n"));

    out.push_str("# HELP lmg_cost_usd_lifetime_total Lifetime estimated spend in USD recorded by the cost pipeline.\n");
    out.push_str("# TYPE lmg_cost_usd_lifetime_total counter\n");
    out.push_str(&format!("lmg_cost_usd_lifetime_total {lifetime_cost_usd}\n"));

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::traffic::{TrafficEntry, TrafficLog};

    fn mock_log() -> Arc<TrafficLog> {
        let log = Arc::new(TrafficLog::new(100));
        log.push(TrafficEntry::new("openai.gpt-4o".into(), "openai.gpt-4o".into(), "openai".into(), 120, true));
        log.push(TrafficEntry::new("openai.gpt-4o".into(), "openai.gpt-4o".into(), "openai".into(), 95, true));
        log.push(TrafficEntry::new("cohere.command-r".into(), "cohere.command-r".into(), "cohere".into(), 430, true));
        log.push(
            TrafficEntry::new("openai.gpt-4o".into(), "anthropic.claude-3-haiku".into(), "anthropic".into(), 80, false)
                .with_error("upstream 500")
                .with_fallback_depth(1),
        );
        log
    }

    #[tokio::test]
    async fn window_size_equals_entry_count() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        assert_eq!(entries.len(), 4);
    }

    #[tokio::test]
    async fn error_count_is_accurate() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        let errors = entries.iter().filter(|e| !e.success).count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn fallback_count_is_accurate() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        let fallbacks = entries.iter().filter(|e| e.fallback_depth > 0).count();
        assert_eq!(fallbacks, 1);
    }

    #[tokio::test]
    async fn latency_sum_is_accurate_per_provider_model() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        let sum: u64 = entries
            .iter()
            .filter(|e| e.provider == "openai" && e.model == "openai.gpt-4o")
            .map(|e| e.latency_ms)
            .sum();
        assert_eq!(sum, 215);
    }
}
