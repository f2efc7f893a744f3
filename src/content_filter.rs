//! Content filter port (spec §4.6). The core only consults this port twice per request
//! (prompt pre-flight, completion post-flight/post-stream) — moderation logic itself is
//! explicitly out of scope (spec §1 Non-goals), so the default implementation here is
//! permissive. A real deployment would substitute a `ContentFilter` backed by an external
//! moderation service.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDirection {
    Prompt,
    Completion,
}

#[derive(Debug, Clone)]
pub struct FilterResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub categories: Vec<String>,
    pub scores: HashMap<String, f32>,
}

impl FilterResult {
    pub fn allow() -> Self {
        Self { allowed: true, reason: None, categories: Vec::new(), scores: HashMap::new() }
    }
}

pub trait ContentFilter: Send + Sync {
    fn check<'a>(
        &'a self,
        text: &'a str,
        direction: FilterDirection,
    ) -> Pin<Box<dyn Future<Output = FilterResult> + Send + 'a>>;
}

/// Default port implementation: always allows. Matches spec §1's "content moderation
/// (the core only consults a filter port)" Non-goal — moderation policy lives outside
/// this crate.
pub struct PermissiveFilter;

impl ContentFilter for PermissiveFilter {
    fn check<'a>(
        &'a self,
        _text: &'a str,
        _direction: FilterDirection,
    ) -> Pin<Box<dyn Future<Output = FilterResult> + Send + 'a>> {
        Box::pin(async { FilterResult::allow() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permissive_filter_always_allows() {
        let filter = PermissiveFilter;
        let result = filter.check("anything at all", FilterDirection::Prompt).await;
        assert!(result.allowed);
    }
}
