//! Circuit breaker isolating a degraded upstream dependency.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::AccessError;

/// Runtime circuit state for upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Time the breaker stays open before permitting a trial call.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Diagnostic snapshot for [`crate::Gateway::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    /// Time until the next trial call is permitted. `None` unless open.
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

impl Default for BreakerInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
        }
    }
}

/// Thread-safe circuit breaker wrapping upstream calls as scoped operations.
///
/// State is per-instance with no persistence; a process restart closes the
/// breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// Run `operation` under the breaker's supervision: fail fast with a
    /// breaker-open error when no call is permitted, otherwise execute and
    /// record the outcome on every exit path, including cancellation. A
    /// future dropped mid-flight counts as an abandoned call: a half-open
    /// trial reverts to open with a fresh reset timer instead of pinning the
    /// breaker half-open with no way out.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, AccessError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AccessError>>,
    {
        if !self.allow_request() {
            return Err(AccessError::breaker_open(format!(
                "breaker is open, retry in {:?}",
                self.status().retry_in.unwrap_or(Duration::ZERO)
            )));
        }

        let mut guard = CallGuard {
            breaker: self,
            armed: true,
        };
        let outcome = operation().await;
        guard.armed = false;

        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Release a call that was granted but never resolved. Only a half-open
    /// trial holds breaker state worth releasing; reverting to open restarts
    /// the reset timer so a later trial is still permitted.
    fn release_abandoned_call(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        if inner.state == CircuitState::HalfOpen {
            warn!("trial call abandoned before resolving, reopening circuit breaker");
            inner.state = CircuitState::Open;
            inner.last_failure_at = Some(Instant::now());
        }
    }

    /// Whether a call may proceed right now. An open breaker whose reset
    /// timeout has elapsed flips to half-open and grants exactly one trial
    /// call; further requests are refused until the trial's outcome is
    /// recorded.
    pub fn allow_request(&self) -> bool {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        match inner.state {
            CircuitState::Closed => true,
            // The single trial call was already granted at the open->half-open
            // transition.
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let can_probe = inner
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);

                if can_probe {
                    debug!("circuit breaker half-open, permitting trial call");
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        if inner.state != CircuitState::Closed {
            debug!("circuit breaker closed after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Instant::now());

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if should_open && inner.state != CircuitState::Open {
            warn!(
                consecutive_failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
            inner.state = CircuitState::Open;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .consecutive_failures
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        let retry_in = match inner.state {
            CircuitState::Open => inner
                .last_failure_at
                .map(|at| self.config.reset_timeout.saturating_sub(at.elapsed())),
            _ => None,
        };

        CircuitBreakerStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            retry_in,
        }
    }
}

/// Armed while a permitted call is in flight; dropping it still armed means
/// the call's future was cancelled before an outcome was recorded.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_abandoned_call();
        }
    }
}
