//! Per-provider circuit breaker (spec §3/§4.2).
//!
//! State transitions: `Closed` -> `Open` after `threshold` consecutive failures;
//! `Open` -> `HalfOpen` after the cooldown window elapses; `HalfOpen` -> `Closed` on the
//! first success, or back to `Open` on failure. One breaker exists per *provider*, not
//! per model, and is shared by every request concurrently dispatching to that provider.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// A single provider's breaker. Uses atomics rather than a mutex so the hot-path check
/// (`is_open`) never blocks (spec §5: "Atomic counter + CAS on state word").
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    state: AtomicU32, // 0 = closed, 1 = open, 2 = half-open
    opened_at: AtomicU64, // monotonic millis since breaker creation, valid only while Open
    probe_admitted: AtomicBool, // set once a half-open probe has been handed out; cleared on trip/reset
    epoch: Instant,
}

const CLOSED: u32 = 0;
const OPEN: u32 = 1;
const HALF_OPEN: u32 = 2;

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            state: AtomicU32::new(CLOSED),
            opened_at: AtomicU64::new(0),
            probe_admitted: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Returns the effective logical state, performing the Open -> HalfOpen transition
    /// lazily once the cooldown has elapsed. This is for introspection (`state_of`); it
    /// does *not* decide admission on its own — see [`Self::is_open`] for that, since more
    /// than one caller can observe `HalfOpen` here before the probe resolves.
    pub fn poll_state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            OPEN => {
                let opened_at = self.opened_at.load(Ordering::Acquire);
                if self.now_millis().saturating_sub(opened_at) >= self.cooldown.as_millis() as u64 {
                    // Whoever observes this first flips the shared state; the one-probe
                    // admission itself is arbitrated separately in `is_open`.
                    let _ = self.state.compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire);
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Whether a request should skip this provider entirely. While half-open, exactly one
    /// caller is admitted as the probe (spec §8 invariant 3: "after cool-down, exactly one
    /// probe is admitted"); every other concurrent caller is treated as open until that
    /// probe's outcome resolves the breaker back to closed or open.
    pub fn is_open(&self) -> bool {
        match self.poll_state() {
            CircuitState::Closed => false,
            CircuitState::Open => true,
            CircuitState::HalfOpen => {
                self.probe_admitted.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err()
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.state.store(CLOSED, Ordering::Release);
        self.probe_admitted.store(false, Ordering::Release);
    }

    pub fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => self.trip(),
            _ => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.threshold {
                    self.trip();
                }
            }
        }
    }

    fn trip(&self) {
        self.opened_at.store(self.now_millis(), Ordering::Release);
        self.state.store(OPEN, Ordering::Release);
        self.probe_admitted.store(false, Ordering::Release);
    }
}

/// One breaker per provider name, created lazily on first use.
#[derive(Default)]
pub struct CircuitRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitRegistry {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self { breakers: DashMap::new(), threshold, cooldown }
    }

    pub fn is_open(&self, provider: &str) -> bool {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown))
            .is_open()
    }

    pub fn record_success(&self, provider: &str) {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown))
            .record_success();
    }

    pub fn record_failure(&self, provider: &str) {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown))
            .record_failure();
    }

    pub fn state_of(&self, provider: &str) -> CircuitState {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown))
            .poll_state()
    }
}
