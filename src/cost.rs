//! Token-usage & cost pipeline (spec §4.4): turns provider-reported or tokenizer-derived
//! counts into a priced, append-only `TokenUsageRecord`, enforces an advisory budget, and
//! answers `SummarizeRange` queries.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::model::{RequestType, TokenUsageRecord};

/// Per-1000-token pricing, resolved from config; `None` when the model is unknown (the
/// caller must fall back to configured default prices and mark the record estimated).
pub struct PricingTable {
    prices: HashMap<String, (f64, f64)>, // canonical model id -> (prompt, completion) per 1k
    fallback_prompt: f64,
    fallback_completion: f64,
}

impl PricingTable {
    pub fn from_config(config: &crate::config::Config) -> Self {
        let mut prices = HashMap::new();
        for descriptor in config.all_models() {
            prices.insert(
                descriptor.id.clone(),
                (descriptor.price_per_1k_prompt, descriptor.price_per_1k_completion),
            );
        }
        Self { prices, fallback_prompt: 0.0, fallback_completion: 0.0 }
    }

    /// Returns `(promptPrice, completionPrice, isFallback)`.
    pub fn get(&self, canonical_model_id: &str) -> (f64, f64, bool) {
        match self.prices.get(canonical_model_id) {
            Some(&(p, c)) => (p, c, false),
            None => (self.fallback_prompt, self.fallback_completion, true),
        }
    }
}

fn compute_cost(prompt_tokens: u32, completion_tokens: u32, prompt_price: f64, completion_price: f64) -> f64 {
    (prompt_tokens as f64) * prompt_price / 1000.0 + (completion_tokens as f64) * completion_price / 1000.0
}

/// Durable append-only usage store (spec §6 `TokenUsageRepository.Append`). The default
/// in-memory implementation is swappable behind this trait; persistence failure must be
/// logged, never surfaced to the caller (spec §4.4).
pub trait TokenUsageRepository: Send + Sync {
    fn append(&self, record: TokenUsageRecord);
}

/// Non-blocking like `traffic::TrafficLog::push` — a durable backend would make this a
/// real async write, but the in-memory default never needs to await anything, so a plain
/// `std::sync::Mutex` keeps `append` synchronous and lock-free on the common path.
#[derive(Default)]
pub struct InMemoryUsageRepository {
    records: std::sync::Mutex<Vec<TokenUsageRecord>>,
}

impl InMemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<TokenUsageRecord> {
        self.records.lock().expect("usage repository mutex poisoned").clone()
    }
}

impl TokenUsageRepository for InMemoryUsageRepository {
    fn append(&self, record: TokenUsageRecord) {
        self.records.lock().expect("usage repository mutex poisoned").push(record);
    }
}

/// Advisory per-user budget check (spec §4.4 "Budget enforcement is advisory").
pub trait BudgetService: Send + Sync {
    /// Returns `true` if admitting a request with the given projected cost would still
    /// keep the user within budget.
    fn projected(&self, user_id: &str, cost_estimate: f64) -> bool;
    fn record_spend(&self, user_id: &str, cost: f64);
}

pub struct InMemoryBudget {
    enforce: bool,
    monthly_limit_usd: Option<f64>,
    spent: dashmap::DashMap<String, f64>,
}

impl InMemoryBudget {
    pub fn from_config(config: &crate::config::BudgetConfig) -> Self {
        Self {
            enforce: config.enforce,
            monthly_limit_usd: config.monthly_limit_usd,
            spent: dashmap::DashMap::new(),
        }
    }
}

impl BudgetService for InMemoryBudget {
    fn projected(&self, user_id: &str, cost_estimate: f64) -> bool {
        if !self.enforce {
            return true;
        }
        let Some(limit) = self.monthly_limit_usd else { return true };
        let current = self.spent.get(user_id).map(|v| *v).unwrap_or(0.0);
        current + cost_estimate <= limit
    }

    fn record_spend(&self, user_id: &str, cost: f64) {
        *self.spent.entry(user_id.to_string()).or_insert(0.0) += cost;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Day,
    Month,
    Model,
    User,
    Provider,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Bucket {
    pub key: String,
    pub request_count: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Summary {
    pub buckets: Vec<Bucket>,
    pub top5: Vec<Bucket>,
}

/// Observability counters — monotonically increasing, cheap to update on every record.
#[derive(Default)]
pub struct Counters {
    pub requests: AtomicU64,
    pub total_tokens: AtomicU64,
    pub total_cost_millicents: AtomicU64, // cost_usd * 100_000, to keep this an integer atomic
}

impl Counters {
    pub fn record(&self, tokens: u32, cost_usd: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_tokens.fetch_add(tokens as u64, Ordering::Relaxed);
        self.total_cost_millicents
            .fetch_add((cost_usd * 100_000.0).round() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, f64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
            self.total_cost_millicents.load(Ordering::Relaxed) as f64 / 100_000.0,
        )
    }
}

pub struct CostPipeline {
    pub pricing: PricingTable,
    pub repository: std::sync::Arc<dyn TokenUsageRepository>,
    pub budget: std::sync::Arc<dyn BudgetService>,
    pub counters: Counters,
}

impl CostPipeline {
    pub fn new(
        pricing: PricingTable,
        repository: std::sync::Arc<dyn TokenUsageRepository>,
        budget: std::sync::Arc<dyn BudgetService>,
    ) -> Self {
        Self { pricing, repository, budget, counters: Counters::default() }
    }

    /// Build, price, and append a usage record. Called after a successful response or
    /// after stream termination — never on a cancelled or denied request (spec §5).
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        request_id: &str,
        user_id: Option<&str>,
        api_key_id: Option<&str>,
        canonical_model_id: &str,
        provider: &str,
        request_type: RequestType,
        prompt_tokens: u32,
        completion_tokens: u32,
        estimated_tokens: bool,
    ) -> TokenUsageRecord {
        let (prompt_price, completion_price, price_is_fallback) = self.pricing.get(canonical_model_id);
        let cost = compute_cost(prompt_tokens, completion_tokens, prompt_price, completion_price);

        let record = TokenUsageRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_id: user_id.map(str::to_string),
            api_key_id: api_key_id.map(str::to_string),
            request_id: request_id.to_string(),
            model_id: canonical_model_id.to_string(),
            provider: provider.to_string(),
            request_type,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated_cost_usd: cost,
            estimated: estimated_tokens || price_is_fallback,
        };

        self.counters.record(record.total_tokens, record.estimated_cost_usd);
        if let Some(uid) = user_id {
            self.budget.record_spend(uid, cost);
        }
        self.repository.append(record.clone());
        record
    }

    pub fn budget_allows(&self, user_id: &str, projected_cost: f64) -> bool {
        self.budget.projected(user_id, projected_cost)
    }
}

/// Summarize a closed range `[start, end]` by the given dimension, zero-filling any
/// day/month bucket with no activity (spec §4.4, invariant 6).
pub fn summarize_range(
    records: &[TokenUsageRecord],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    group_by: GroupBy,
) -> Summary {
    let in_range: Vec<&TokenUsageRecord> =
        records.iter().filter(|r| r.timestamp >= start && r.timestamp <= end).collect();

    let mut buckets: BTreeMap<String, Bucket> = BTreeMap::new();

    match group_by {
        GroupBy::Day => {
            let mut day = start.date_naive();
            let end_day = end.date_naive();
            while day <= end_day {
                let key = day.format("%Y-%m-%d").to_string();
                buckets.insert(key.clone(), Bucket { key, request_count: 0, total_tokens: 0, total_cost_usd: 0.0 });
                day += ChronoDuration::days(1);
            }
            for r in &in_range {
                let key = r.timestamp.date_naive().format("%Y-%m-%d").to_string();
                accumulate(&mut buckets, key, r);
            }
        }
        GroupBy::Month => {
            let mut y = start.year();
            let mut m = start.month();
            loop {
                let key = format!("{y:04}-{m:02}");
                buckets.insert(key.clone(), Bucket { key, request_count: 0, total_tokens: 0, total_cost_usd: 0.0 });
                if y == end.year() && m == end.month() {
                    break;
                }
                m += 1;
                if m > 12 {
                    m = 1;
                    y += 1;
                }
            }
            for r in &in_range {
                let key = format!("{:04}-{:02}", r.timestamp.year(), r.timestamp.month());
                accumulate(&mut buckets, key, r);
            }
        }
        GroupBy::Model => {
            for r in &in_range {
                accumulate(&mut buckets, r.model_id.clone(), r);
            }
        }
        GroupBy::User => {
            for r in &in_range {
                let key = r.user_id.clone().unwrap_or_else(|| "unknown".to_string());
                accumulate(&mut buckets, key, r);
            }
        }
        GroupBy::Provider => {
            for r in &in_range {
                accumulate(&mut buckets, r.provider.clone(), r);
            }
        }
    }

    let mut all: Vec<Bucket> = buckets.into_values().collect();
    let mut top5 = all.clone();
    top5.sort_by(|a, b| b.total_cost_usd.partial_cmp(&a.total_cost_usd).unwrap());
    top5.truncate(5);

    all.sort_by(|a, b| a.key.cmp(&b.key));
    Summary { buckets: all, top5 }
}

fn accumulate(buckets: &mut BTreeMap<String, Bucket>, key: String, r: &TokenUsageRecord) {
    let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
        key,
        request_count: 0,
        total_tokens: 0,
        total_cost_usd: 0.0,
    });
    bucket.request_count += 1;
    bucket.total_tokens += r.total_tokens as u64;
    bucket.total_cost_usd += r.estimated_cost_usd;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_record(model: &str, provider: &str, ts: DateTime<Utc>, cost: f64) -> TokenUsageRecord {
        TokenUsageRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: ts,
            user_id: Some("u1".into()),
            api_key_id: None,
            request_id: Uuid::new_v4().to_string(),
            model_id: model.into(),
            provider: provider.into(),
            request_type: RequestType::Completion,
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            estimated_cost_usd: cost,
            estimated: false,
        }
    }

    #[test]
    fn compute_cost_is_linear_in_tokens() {
        let cost = compute_cost(1000, 1000, 0.01, 0.03);
        assert!((cost - 0.04).abs() < 1e-9);
    }

    #[test]
    fn summarize_by_day_zero_fills_inactive_days() {
        let start = Utc::now();
        let end = start + ChronoDuration::days(3);
        let records = vec![make_record("openai.gpt-4", "openai", start, 1.0)];
        let summary = summarize_range(&records, start, end, GroupBy::Day);
        assert_eq!(summary.buckets.len(), 4, "(end - start) + 1 day buckets");
        assert!(summary.buckets.iter().any(|b| b.total_cost_usd == 0.0));
    }

    #[test]
    fn summarize_by_model_groups_correctly() {
        let now = Utc::now();
        let records = vec![
            make_record("openai.gpt-4", "openai", now, 1.0),
            make_record("openai.gpt-4", "openai", now, 2.0),
            make_record("anthropic.claude-3-opus", "anthropic", now, 5.0),
        ];
        let summary = summarize_range(&records, now - ChronoDuration::hours(1), now + ChronoDuration::hours(1), GroupBy::Model);
        let gpt4 = summary.buckets.iter().find(|b| b.key == "openai.gpt-4").unwrap();
        assert_eq!(gpt4.request_count, 2);
        assert!((gpt4.total_cost_usd - 3.0).abs() < 1e-9);
    }

    #[test]
    fn top5_sorted_by_cost_descending() {
        let now = Utc::now();
        let records = vec![
            make_record("a.m1", "a", now, 1.0),
            make_record("b.m2", "b", now, 9.0),
            make_record("c.m3", "c", now, 5.0),
        ];
        let summary = summarize_range(&records, now - ChronoDuration::hours(1), now + ChronoDuration::hours(1), GroupBy::Provider);
        assert_eq!(summary.top5[0].key, "b");
    }

    #[test]
    fn budget_denies_when_over_limit() {
        let budget = InMemoryBudget {
            enforce: true,
            monthly_limit_usd: Some(10.0),
            spent: dashmap::DashMap::new(),
        };
        assert!(budget.projected("u1", 5.0));
        budget.record_spend("u1", 8.0);
        assert!(!budget.projected("u1", 5.0));
    }

    #[test]
    fn budget_allows_everything_when_not_enforced() {
        let budget = InMemoryBudget { enforce: false, monthly_limit_usd: Some(1.0), spent: dashmap::DashMap::new() };
        assert!(budget.projected("u1", 1_000_000.0));
    }

    #[tokio::test]
    async fn cost_pipeline_appends_and_counts() {
        let mut prices = HashMap::new();
        prices.insert("openai.gpt-4".to_string(), (0.01, 0.03));
        let pricing = PricingTable { prices, fallback_prompt: 0.0, fallback_completion: 0.0 };
        let repo = Arc::new(InMemoryUsageRepository::new());
        let budget = Arc::new(InMemoryBudget { enforce: false, monthly_limit_usd: None, spent: dashmap::DashMap::new() });
        let pipeline = CostPipeline::new(pricing, repo.clone(), budget);

        pipeline.record("req1", Some("u1"), None, "openai.gpt-4", "openai", RequestType::Completion, 100, 50, false);

        let (requests, tokens, _cost) = pipeline.counters.snapshot();
        assert_eq!(requests, 1);
        assert_eq!(tokens, 150);
    }
}
