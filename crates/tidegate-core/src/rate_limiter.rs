//! Sliding-window rate limiting with independent per-endpoint buckets.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::backoff::BackoffPolicy;

/// Rate limiter budgets and windows.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Sliding-window budget over [`Self::window`].
    pub requests_per_minute: u32,
    /// Maximum requests permitted within any [`Self::burst_window`].
    pub burst_limit: u32,
    /// Span of the sliding budget window.
    pub window: Duration,
    /// Span of the short burst window.
    pub burst_window: Duration,
    /// Schedule used by [`RateLimiter::exponential_backoff`] when the
    /// provider itself signals throttling.
    pub backoff: BackoffPolicy,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_limit: 10,
            window: Duration::from_secs(60),
            burst_window: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Point-in-time budget report for one endpoint bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimiterStatus {
    pub requests_in_window: u32,
    pub remaining: u32,
    /// Time until the oldest recorded request leaves the window. Zero when
    /// the bucket is empty.
    pub window_resets_in: Duration,
}

/// Sliding-window rate limiter keyed by logical endpoint.
///
/// Each endpoint owns an independent timestamp window; exhausting one
/// endpoint's budget never affects another's `acquire` outcome.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Record a request against the endpoint's budget if one is permitted
    /// right now. Refusal has no side effect.
    pub fn acquire(&self, endpoint: &str) -> bool {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .expect("rate limiter window lock is not poisoned");
        let window = windows.entry(endpoint.to_string()).or_default();
        Self::evict_expired(window, now, self.config.window);

        if self.permitted_wait(window, now).is_some() {
            return false;
        }

        window.push_back(now);
        true
    }

    /// Suspend the calling task until capacity is available, then record the
    /// request. Only the caller suspends; the wait is bounded by the window
    /// span.
    pub async fn wait_if_needed(&self, endpoint: &str) {
        loop {
            let wait = {
                let now = Instant::now();
                let mut windows = self
                    .windows
                    .lock()
                    .expect("rate limiter window lock is not poisoned");
                let window = windows.entry(endpoint.to_string()).or_default();
                Self::evict_expired(window, now, self.config.window);

                match self.permitted_wait(window, now) {
                    None => {
                        window.push_back(now);
                        return;
                    }
                    Some(wait) => wait,
                }
            };

            debug!(
                endpoint,
                wait_ms = wait.as_millis() as u64,
                "rate budget exhausted, waiting for window"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Sleep out a provider-side throttle signal. Independent of local
    /// capacity: the provider told us to slow down, so we do, even if our own
    /// window still has budget.
    pub async fn exponential_backoff(&self, endpoint: &str, attempt: u32) {
        let delay = self.config.backoff.delay_for_attempt(attempt);
        debug!(
            endpoint,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "provider throttled, backing off"
        );
        tokio::time::sleep(delay).await;
    }

    /// Budget report for one endpoint.
    pub fn status(&self, endpoint: &str) -> RateLimiterStatus {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .expect("rate limiter window lock is not poisoned");
        let window = windows.entry(endpoint.to_string()).or_default();
        Self::evict_expired(window, now, self.config.window);
        self.snapshot(window, now)
    }

    /// Budget reports for every endpoint seen so far, taken under a single
    /// lock acquisition so the snapshot is internally consistent.
    pub fn status_all(&self) -> HashMap<String, RateLimiterStatus> {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .expect("rate limiter window lock is not poisoned");

        windows
            .iter_mut()
            .map(|(endpoint, window)| {
                Self::evict_expired(window, now, self.config.window);
                (endpoint.clone(), self.snapshot(window, now))
            })
            .collect()
    }

    fn snapshot(&self, window: &VecDeque<Instant>, now: Instant) -> RateLimiterStatus {
        let used = window.len() as u32;
        let resets_in = window
            .front()
            .map(|oldest| self.config.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(Duration::ZERO);

        RateLimiterStatus {
            requests_in_window: used,
            remaining: self.config.requests_per_minute.saturating_sub(used),
            window_resets_in: resets_in,
        }
    }

    /// Clear an endpoint's history. Used by tests and manual recovery.
    pub fn reset_endpoint(&self, endpoint: &str) {
        let mut windows = self
            .windows
            .lock()
            .expect("rate limiter window lock is not poisoned");
        windows.remove(endpoint);
    }

    /// Returns the wait needed before a new request fits, or `None` when one
    /// is permitted now. Assumes expired timestamps were already evicted.
    fn permitted_wait(&self, window: &VecDeque<Instant>, now: Instant) -> Option<Duration> {
        if window.len() as u32 >= self.config.requests_per_minute {
            let oldest = window.front().copied().unwrap_or(now);
            let wait = self
                .config
                .window
                .saturating_sub(now.duration_since(oldest));
            return Some(wait.max(Duration::from_millis(1)));
        }

        let in_burst = window
            .iter()
            .rev()
            .take_while(|stamp| now.duration_since(**stamp) < self.config.burst_window)
            .count() as u32;
        if in_burst >= self.config.burst_limit {
            let oldest_in_burst = window
                .iter()
                .rev()
                .take(in_burst as usize)
                .last()
                .copied()
                .unwrap_or(now);
            let wait = self
                .config
                .burst_window
                .saturating_sub(now.duration_since(oldest_in_burst));
            return Some(wait.max(Duration::from_millis(1)));
        }

        None
    }

    fn evict_expired(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= span {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}
