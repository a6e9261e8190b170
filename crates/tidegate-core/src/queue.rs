//! Priority-ordered asynchronous request queue with retry and backoff.
//!
//! A fixed pool of workers drains four strict-priority FIFO queues, applying
//! the shared rate limiter and circuit breaker to every attempt. Failed
//! attempts re-enter their original priority queue after an exponential
//! delay until the retry ceiling is reached.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::AccessError;
use crate::rate_limiter::RateLimiter;
use uuid::Uuid;

/// Outcome of one execution of a queued operation.
pub type OperationResult = Result<Value, AccessError>;
/// Boxed future produced by each execution attempt.
pub type OperationFuture = Pin<Box<dyn Future<Output = OperationResult> + Send>>;
/// Re-runnable operation supplied by the caller at enqueue time.
pub type Operation = Arc<dyn Fn() -> OperationFuture + Send + Sync>;
/// Continuation invoked exactly once with the result of a completed request.
pub type Callback = Box<dyn FnOnce(&Value) + Send>;

const PRIORITY_LEVELS: usize = 4;

/// Scheduling priority; higher values are serviced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl Priority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

/// Lifecycle state of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl RequestStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One unit of work owned by exactly one of: a priority queue, the
/// processing set, the completed list, or the failed list.
pub struct QueuedRequest {
    pub id: Uuid,
    pub endpoint: String,
    pub method: String,
    pub params: Value,
    pub priority: Priority,
    pub status: RequestStatus,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub attempts: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    operation: Operation,
    callback: Option<Callback>,
}

impl QueuedRequest {
    fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            id: self.id,
            endpoint: self.endpoint.clone(),
            method: self.method.clone(),
            priority: self.priority,
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            attempts: self.attempts,
            max_retries: self.max_retries,
            error_message: self.error_message.clone(),
        }
    }
}

/// Owned view of a request's lifecycle, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestSnapshot {
    pub id: Uuid,
    pub endpoint: String,
    pub method: String,
    pub priority: Priority,
    pub status: RequestStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub attempts: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
}

/// Queue sizing and retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Fixed worker pool size.
    pub max_concurrent_workers: usize,
    /// Retry ceiling applied when the caller does not choose one.
    pub default_max_retries: u32,
    /// Delay schedule between failed attempts; distinct from the rate
    /// limiter's provider backoff.
    pub retry_backoff: BackoffPolicy,
    /// How long an idle worker sleeps before re-checking the queues.
    pub idle_poll: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 5,
            default_max_retries: 3,
            retry_backoff: BackoffPolicy::default(),
            idle_poll: Duration::from_millis(100),
        }
    }
}

/// Pending depth per priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

/// Diagnostic snapshot of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub running: bool,
    pub workers: usize,
    pub processing_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub queued: QueueDepths,
}

#[derive(Default)]
struct QueueInner {
    pending: [VecDeque<QueuedRequest>; PRIORITY_LEVELS],
    processing: HashMap<Uuid, QueuedRequest>,
    completed: Vec<QueuedRequest>,
    failed: Vec<QueuedRequest>,
}

struct QueueCore {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    notify: Notify,
    running: AtomicBool,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
}

/// Priority request queue sharing the caller's rate limiter and breaker.
pub struct RequestQueue {
    core: Arc<QueueCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestQueue {
    pub fn new(
        config: QueueConfig,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            core: Arc::new(QueueCore {
                config,
                inner: Mutex::new(QueueInner::default()),
                notify: Notify::new(),
                running: AtomicBool::new(false),
                limiter,
                breaker,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Idempotent: a running queue is left alone.
    pub fn start(&self) {
        if self
            .core
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut workers = self.workers.lock().expect("queue worker lock is not poisoned");
        for worker_id in 0..self.core.config.max_concurrent_workers {
            let core = Arc::clone(&self.core);
            workers.push(tokio::spawn(worker_loop(core, worker_id)));
        }
        debug!(workers = self.core.config.max_concurrent_workers, "request queue started");
    }

    /// Stop accepting work and cancel in-flight workers. Any request still
    /// processing is marked failed with a "cancelled at shutdown" reason;
    /// pending requests stay pending for a later restart.
    pub async fn stop(&self) {
        self.core.running.store(false, Ordering::SeqCst);
        self.core.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("queue worker lock is not poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        let now = OffsetDateTime::now_utc();
        let mut inner = self.core.inner.lock().expect("queue state lock is not poisoned");
        let cancelled: Vec<Uuid> = inner.processing.keys().copied().collect();
        for id in cancelled {
            if let Some(mut request) = inner.processing.remove(&id) {
                request.status = RequestStatus::Failed;
                request.completed_at = Some(now);
                request.error_message = Some(String::from("cancelled at shutdown"));
                warn!(request_id = %id, "request cancelled at shutdown");
                inner.failed.push(request);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Non-blocking enqueue; returns the request's id immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        params: Value,
        priority: Priority,
        max_retries: u32,
        operation: Operation,
        callback: Option<Callback>,
    ) -> Uuid {
        let request = QueuedRequest {
            id: Uuid::new_v4(),
            endpoint: endpoint.into(),
            method: method.into(),
            params,
            priority,
            status: RequestStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_retries,
            error_message: None,
            operation,
            callback,
        };
        let id = request.id;

        {
            let mut inner = self.core.inner.lock().expect("queue state lock is not poisoned");
            inner.pending[priority.index()].push_back(request);
        }
        self.core.notify.notify_one();
        id
    }

    /// Look up a request across the pending, processing, completed, and
    /// failed sets.
    pub fn request_status(&self, id: Uuid) -> Option<RequestSnapshot> {
        let inner = self.core.inner.lock().expect("queue state lock is not poisoned");

        if let Some(request) = inner.processing.get(&id) {
            return Some(request.snapshot());
        }
        for queue in &inner.pending {
            if let Some(request) = queue.iter().find(|request| request.id == id) {
                return Some(request.snapshot());
            }
        }
        inner
            .completed
            .iter()
            .chain(inner.failed.iter())
            .find(|request| request.id == id)
            .map(QueuedRequest::snapshot)
    }

    pub fn status(&self) -> QueueStatus {
        let workers = self.workers.lock().expect("queue worker lock is not poisoned").len();
        let inner = self.core.inner.lock().expect("queue state lock is not poisoned");

        QueueStatus {
            running: self.core.running.load(Ordering::SeqCst),
            workers,
            processing_count: inner.processing.len(),
            completed_count: inner.completed.len(),
            failed_count: inner.failed.len(),
            queued: QueueDepths {
                low: inner.pending[Priority::Low.index()].len(),
                medium: inner.pending[Priority::Medium.index()].len(),
                high: inner.pending[Priority::High.index()].len(),
                critical: inner.pending[Priority::Critical.index()].len(),
            },
        }
    }

    /// Drop completed and failed requests whose terminal timestamp predates
    /// the cutoff. Requests still pending or processing are never removed,
    /// regardless of age. Returns the count removed.
    pub fn clear_completed(&self, older_than_hours: u64) -> usize {
        let age = match i64::try_from(older_than_hours) {
            Ok(hours) if hours <= time::Duration::MAX.whole_hours() => {
                time::Duration::hours(hours)
            }
            _ => time::Duration::MAX,
        };
        // a cutoff before representable time means nothing is old enough
        let Some(cutoff) = OffsetDateTime::now_utc().checked_sub(age) else {
            return 0;
        };
        let mut inner = self.core.inner.lock().expect("queue state lock is not poisoned");

        let before = inner.completed.len() + inner.failed.len();
        inner
            .completed
            .retain(|request| request.completed_at.map(|at| at > cutoff).unwrap_or(true));
        inner
            .failed
            .retain(|request| request.completed_at.map(|at| at > cutoff).unwrap_or(true));
        before - (inner.completed.len() + inner.failed.len())
    }
}

impl QueueCore {
    /// Take the head of the highest non-empty priority queue, marking it
    /// processing and recording the attempt.
    fn take_next(&self) -> Option<(Uuid, String, Operation)> {
        let mut inner = self.inner.lock().expect("queue state lock is not poisoned");
        for level in (0..PRIORITY_LEVELS).rev() {
            if let Some(mut request) = inner.pending[level].pop_front() {
                request.status = RequestStatus::Processing;
                request.attempts = request.attempts.saturating_add(1);
                if request.started_at.is_none() {
                    request.started_at = Some(OffsetDateTime::now_utc());
                }

                let id = request.id;
                let endpoint = request.endpoint.clone();
                let operation = Arc::clone(&request.operation);
                inner.processing.insert(id, request);
                return Some((id, endpoint, operation));
            }
        }
        None
    }

    /// Retire a successful request and run its callback exactly once.
    /// Callback panics are logged and never affect the completed status.
    fn complete(&self, id: Uuid, value: Value) {
        let callback = {
            let mut inner = self.inner.lock().expect("queue state lock is not poisoned");
            let Some(mut request) = inner.processing.remove(&id) else {
                return;
            };
            request.status = RequestStatus::Completed;
            request.completed_at = Some(OffsetDateTime::now_utc());
            request.error_message = None;
            let callback = request.callback.take();
            inner.completed.push(request);
            callback
        };

        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(&value))).is_err() {
                warn!(request_id = %id, "completion callback panicked");
            }
        }
        debug!(request_id = %id, "request completed");
    }

    /// Record a failed attempt. Returns the retry delay when the request
    /// should be re-queued, or `None` once it is terminally failed.
    fn fail_attempt(&self, id: Uuid, error: &AccessError) -> Option<Duration> {
        let mut inner = self.inner.lock().expect("queue state lock is not poisoned");
        let exhausted = {
            let request = inner.processing.get_mut(&id)?;
            request.error_message = Some(error.to_string());
            request.attempts >= request.max_retries
        };

        if exhausted {
            let mut request = inner.processing.remove(&id)?;
            request.status = RequestStatus::Failed;
            request.completed_at = Some(OffsetDateTime::now_utc());
            warn!(
                request_id = %id,
                attempts = request.attempts,
                error = %error,
                "request failed terminally"
            );
            inner.failed.push(request);
            return None;
        }

        let request = inner.processing.get_mut(&id)?;
        request.status = RequestStatus::Retrying;
        let delay = self.config.retry_backoff.delay_for_attempt(request.attempts);
        debug!(
            request_id = %id,
            attempt = request.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "request attempt failed, scheduling retry"
        );
        Some(delay)
    }

    /// Move a retrying request back to the tail of its priority queue.
    fn requeue(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("queue state lock is not poisoned");
        if let Some(mut request) = inner.processing.remove(&id) {
            request.status = RequestStatus::Pending;
            let level = request.priority.index();
            inner.pending[level].push_back(request);
        }
        drop(inner);
        self.notify.notify_one();
    }
}

async fn worker_loop(core: Arc<QueueCore>, worker_id: usize) {
    debug!(worker_id, "queue worker started");
    while core.running.load(Ordering::SeqCst) {
        let Some((id, endpoint, operation)) = core.take_next() else {
            tokio::select! {
                _ = core.notify.notified() => {}
                _ = tokio::time::sleep(core.config.idle_poll) => {}
            }
            continue;
        };

        core.limiter.wait_if_needed(&endpoint).await;
        let result = core.breaker.call(|| operation()).await;

        match result {
            Ok(value) => core.complete(id, value),
            Err(err) => {
                if let Some(delay) = core.fail_attempt(id, &err) {
                    tokio::time::sleep(delay).await;
                    core.requeue(id);
                }
            }
        }
    }
    debug!(worker_id, "queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::rate_limiter::RateLimiterConfig;
    use serde_json::json;

    fn test_queue(workers: usize) -> RequestQueue {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            requests_per_minute: 10_000,
            burst_limit: 10_000,
            ..RateLimiterConfig::default()
        }));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: u32::MAX,
            reset_timeout: Duration::from_secs(60),
        }));
        RequestQueue::new(
            QueueConfig {
                max_concurrent_workers: workers,
                retry_backoff: BackoffPolicy::deterministic(
                    Duration::from_millis(5),
                    1.0,
                    Duration::from_millis(5),
                ),
                idle_poll: Duration::from_millis(10),
                ..QueueConfig::default()
            },
            limiter,
            breaker,
        )
    }

    fn op_ok(value: Value) -> Operation {
        Arc::new(move || -> OperationFuture {
            let value = value.clone();
            Box::pin(async move { Ok(value) })
        })
    }

    fn op_fail(message: &'static str) -> Operation {
        Arc::new(move || -> OperationFuture {
            Box::pin(async move { Err(AccessError::dependency(message)) })
        })
    }

    fn op_record(log: Arc<Mutex<Vec<String>>>, label: &str) -> Operation {
        let label = label.to_string();
        Arc::new(move || -> OperationFuture {
            let log = Arc::clone(&log);
            let label = label.clone();
            Box::pin(async move {
                log.lock().expect("log lock").push(label);
                Ok(json!(null))
            })
        })
    }

    async fn wait_for_terminal(queue: &RequestQueue, expected: usize) {
        for _ in 0..400 {
            let status = queue.status();
            if status.completed_count + status.failed_count >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not drain {expected} requests in time");
    }

    #[tokio::test]
    async fn enqueue_is_non_blocking_and_returns_pending_id() {
        let queue = test_queue(1);

        let id = queue.enqueue(
            "external_api",
            "get_quote",
            json!({"symbol": "AAPL"}),
            Priority::Medium,
            3,
            op_ok(json!({"price": 1.0})),
            None,
        );

        let snapshot = queue.request_status(id).expect("pending request is visible");
        assert_eq!(snapshot.status, RequestStatus::Pending);
        assert_eq!(snapshot.attempts, 0);
        assert!(snapshot.started_at.is_none());
    }

    #[tokio::test]
    async fn higher_priorities_process_first_fifo_within_level() {
        let queue = test_queue(1);
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.enqueue("e", "m", json!({}), Priority::Low, 0, op_record(Arc::clone(&log), "low-1"), None);
        queue.enqueue("e", "m", json!({}), Priority::High, 0, op_record(Arc::clone(&log), "high"), None);
        queue.enqueue("e", "m", json!({}), Priority::Low, 0, op_record(Arc::clone(&log), "low-2"), None);
        queue.enqueue("e", "m", json!({}), Priority::Critical, 0, op_record(Arc::clone(&log), "critical"), None);

        queue.start();
        wait_for_terminal(&queue, 4).await;
        queue.stop().await;

        let order = log.lock().expect("log lock").clone();
        assert_eq!(order, vec!["critical", "high", "low-1", "low-2"]);
    }

    #[tokio::test]
    async fn failing_request_retries_then_fails_terminally() {
        let queue = test_queue(1);

        let id = queue.enqueue(
            "external_api",
            "get_quote",
            json!({}),
            Priority::Medium,
            3,
            op_fail("upstream unreachable"),
            None,
        );

        queue.start();
        wait_for_terminal(&queue, 1).await;
        queue.stop().await;

        let snapshot = queue.request_status(id).expect("failed request is visible");
        assert_eq!(snapshot.status, RequestStatus::Failed);
        assert_eq!(snapshot.attempts, 3);
        let message = snapshot.error_message.expect("failure reason recorded");
        assert!(message.contains("upstream unreachable"));
        assert!(snapshot.completed_at.is_some());
    }

    #[tokio::test]
    async fn callback_runs_once_and_panics_are_contained() {
        let queue = test_queue(1);
        let calls = Arc::new(Mutex::new(0u32));

        let counted = Arc::clone(&calls);
        let id = queue.enqueue(
            "external_api",
            "get_quote",
            json!({}),
            Priority::High,
            0,
            op_ok(json!({"price": 42.0})),
            Some(Box::new(move |value| {
                *counted.lock().expect("call counter") += 1;
                assert_eq!(value["price"], 42.0);
                panic!("callback blew up");
            })),
        );

        queue.start();
        wait_for_terminal(&queue, 1).await;
        queue.stop().await;

        assert_eq!(*calls.lock().expect("call counter"), 1);
        let snapshot = queue.request_status(id).expect("completed request is visible");
        assert_eq!(snapshot.status, RequestStatus::Completed);
        assert!(snapshot.error_message.is_none());
    }

    #[tokio::test]
    async fn clear_completed_spares_pending_requests() {
        let queue = test_queue(1);

        let done = queue.enqueue("e", "m", json!({}), Priority::Medium, 0, op_ok(json!(1)), None);
        queue.start();
        wait_for_terminal(&queue, 1).await;
        queue.stop().await;

        // enqueued after stop, so it stays pending regardless of age
        let parked = queue.enqueue("e", "m", json!({}), Priority::Low, 0, op_ok(json!(2)), None);

        let removed = queue.clear_completed(0);
        assert_eq!(removed, 1);
        assert!(queue.request_status(done).is_none());

        let snapshot = queue.request_status(parked).expect("pending survives cleanup");
        assert_eq!(snapshot.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn clear_completed_tolerates_extreme_cutoffs() {
        let queue = test_queue(1);

        let done = queue.enqueue("e", "m", json!({}), Priority::Medium, 0, op_ok(json!(1)), None);
        queue.start();
        wait_for_terminal(&queue, 1).await;
        queue.stop().await;

        // a cutoff older than representable time removes nothing
        assert_eq!(queue.clear_completed(u64::MAX), 0);
        assert!(queue.request_status(done).is_some());

        assert_eq!(queue.clear_completed(0), 1);
        assert!(queue.request_status(done).is_none());
    }

    #[tokio::test]
    async fn stop_marks_in_flight_requests_cancelled() {
        let queue = test_queue(1);

        let id = queue.enqueue(
            "external_api",
            "slow_call",
            json!({}),
            Priority::Medium,
            3,
            Arc::new(|| -> OperationFuture {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(json!(null))
                })
            }),
            None,
        );

        queue.start();
        // give the worker time to pick the request up
        for _ in 0..100 {
            if queue.status().processing_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(queue.status().processing_count, 1);

        queue.stop().await;

        let snapshot = queue.request_status(id).expect("cancelled request is visible");
        assert_eq!(snapshot.status, RequestStatus::Failed);
        assert_eq!(
            snapshot.error_message.as_deref(),
            Some("cancelled at shutdown")
        );
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn status_reports_depths_per_priority() {
        let queue = test_queue(2);

        queue.enqueue("e", "m", json!({}), Priority::Low, 0, op_ok(json!(1)), None);
        queue.enqueue("e", "m", json!({}), Priority::Low, 0, op_ok(json!(2)), None);
        queue.enqueue("e", "m", json!({}), Priority::Critical, 0, op_ok(json!(3)), None);

        let status = queue.status();
        assert!(!status.running);
        assert_eq!(status.workers, 0);
        assert_eq!(status.queued.low, 2);
        assert_eq!(status.queued.critical, 1);
        assert_eq!(status.queued.medium, 0);
        assert_eq!(status.completed_count, 0);
    }
}
