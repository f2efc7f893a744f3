//! In-memory traffic log exposed through the admin API.
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest entry
//! is evicted to make room for the newest. This gives a bounded, O(1) memory
//! footprint regardless of request volume.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Fixed-capacity ring-buffer of recent [`TrafficEntry`] records.
///
/// Safe to share across threads via `Arc<TrafficLog>`. [`push`][Self::push] uses
/// a non-blocking `try_lock` so it never delays request handling; in the
/// unlikely event of lock contention the entry is silently dropped.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    /// Create a new log with the given capacity.
    ///
    /// `capacity` is the maximum number of entries retained. Older entries are
    /// silently dropped once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed request.
    ///
    /// This is a best-effort, non-blocking operation: if the mutex is contended
    /// the entry is dropped rather than blocking the request path.
    pub fn push(&self, entry: TrafficEntry) {
        // Best-effort non-blocking push — drop if lock contention
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Compute aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();
        let fallback_count = entries.iter().filter(|e| e.fallback_depth > 0).count();

        let mut provider_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for entry in entries.iter() {
            *provider_counts.entry(entry.provider.clone()).or_default() += 1;
        }

        TrafficStats {
            total_requests: total,
            error_count,
            fallback_count,
            avg_latency_ms,
            provider_counts,
        }
    }
}

/// A single request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    /// Unique request ID.
    pub id: String,
    /// Timestamp of the request.
    pub timestamp: DateTime<Utc>,
    /// Canonical model id (`provider.model`) the client originally requested.
    pub requested_model: String,
    /// Canonical model id that ultimately served the request, after any fallback.
    pub model: String,
    /// Provider that served the request.
    pub provider: String,
    /// Routing strategy that produced the winning candidate (`"smart"`, `"cost"`, ...).
    pub strategy: String,
    /// How many fallback hops were taken before this provider answered (0 = first try).
    pub fallback_depth: u32,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// Whether the provider returned a success response.
    pub success: bool,
    /// Error description when `success` is `false`.
    pub error: Option<String>,
}

impl TrafficEntry {
    pub fn new(requested_model: String, model: String, provider: String, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            requested_model,
            model,
            provider,
            strategy: String::new(),
            fallback_depth: 0,
            latency_ms,
            success,
            error: None,
        }
    }

    /// Attach the routing strategy name that chose this candidate.
    pub fn with_strategy(mut self, strategy: &str) -> Self {
        self.strategy = strategy.to_string();
        self
    }

    /// Attach how many fallback hops preceded this attempt.
    pub fn with_fallback_depth(mut self, depth: u32) -> Self {
        self.fallback_depth = depth;
        self
    }

    /// Attach an error description for failed requests.
    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_string());
        self
    }
}

/// Aggregate statistics derived from all buffered [`TrafficEntry`] records.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    /// Number of requests that returned an error.
    pub error_count: usize,
    /// Number of requests that required at least one fallback hop.
    pub fallback_count: usize,
    pub avg_latency_ms: f64,
    pub provider_counts: std::collections::HashMap<String, usize>,
}
