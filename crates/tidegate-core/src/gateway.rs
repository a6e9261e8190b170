//! Client-facing façade composing the cache, rate limiter, circuit breaker,
//! and request queue.
//!
//! Construct one [`Gateway`] per client instance and share it by reference;
//! there are no process-wide singletons.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{Cache, CacheConfig, CacheStats};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use crate::error::AccessError;
use crate::http_client::{HttpClient, HttpRequest, NoopHttpClient};
use crate::queue::{
    Callback, Operation, Priority, QueueConfig, QueueStatus, RequestQueue, RequestSnapshot,
};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStatus};

/// Top-level configuration with defaults for every knob.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    /// Rate-limit bucket used by [`Gateway::cached_request`].
    pub default_endpoint: String,
    /// URL probed by [`Gateway::health_check`]; no dependency probe runs
    /// when unset.
    pub dependency_probe_url: Option<String>,
    pub rate_limiter: RateLimiterConfig,
    pub breaker: CircuitBreakerConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_endpoint: String::from("external_api"),
            dependency_probe_url: None,
            rate_limiter: RateLimiterConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// Coarse health rating for one probe target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Per-component health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatewayHealth {
    pub overall: HealthState,
    pub dependency: HealthState,
    pub cache: HealthState,
    pub rate_limiter: HealthState,
    pub queue: HealthState,
}

/// Aggregated diagnostic snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayStats {
    pub rate_limiter: HashMap<String, RateLimiterStatus>,
    pub breaker: CircuitBreakerStatus,
    pub queue: QueueStatus,
    pub cache: CacheStats,
}

/// Resilient access gateway for one upstream API client.
pub struct Gateway {
    default_endpoint: String,
    probe_url: Option<String>,
    default_max_retries: u32,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    cache: Cache,
    queue: RequestQueue,
    transport: Arc<dyn HttpClient>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

impl Gateway {
    /// Build a gateway with the no-op transport, suitable for tests and for
    /// callers that never use the dependency probe.
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_transport(config, Arc::new(NoopHttpClient))
    }

    /// Build a gateway probing the dependency through the given transport.
    pub fn with_transport(config: GatewayConfig, transport: Arc<dyn HttpClient>) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limiter));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker));
        let default_max_retries = config.queue.default_max_retries;
        let queue = RequestQueue::new(config.queue, Arc::clone(&limiter), Arc::clone(&breaker));

        Self {
            default_endpoint: config.default_endpoint,
            probe_url: config.dependency_probe_url,
            default_max_retries,
            limiter,
            breaker,
            cache: Cache::new(config.cache),
            queue,
            transport,
        }
    }

    /// Start the background worker pool.
    pub fn start(&self) {
        self.queue.start();
    }

    /// Stop workers; in-flight requests are marked failed as cancelled.
    pub async fn stop(&self) {
        self.queue.stop().await;
    }

    /// Cache-or-fetch: a hit returns immediately with no rate-limiter or
    /// upstream interaction; a miss waits for rate budget, runs the
    /// operation under the breaker, then writes the result back with the
    /// given TTL. Cache write failures are soft and never fail the fetch.
    pub async fn cached_request<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        operation: F,
    ) -> Result<Value, AccessError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, AccessError>>,
    {
        if let Some(hit) = self.cache.get::<Value>(key).await {
            return Ok(hit);
        }

        self.limiter.wait_if_needed(&self.default_endpoint).await;
        let value = self.breaker.call(operation).await?;

        if !self.cache.set(key, &value, ttl).await {
            debug!(key, "cache write failed, returning live result");
        }
        Ok(value)
    }

    /// Schedule a background operation on the shared queue. Non-blocking;
    /// the returned id can be polled with [`Gateway::request_status`].
    pub fn enqueue(
        &self,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        params: Value,
        priority: Priority,
        max_retries: Option<u32>,
        operation: Operation,
        callback: Option<Callback>,
    ) -> Uuid {
        let max_retries = max_retries.unwrap_or(self.default_max_retries);
        self.queue
            .enqueue(endpoint, method, params, priority, max_retries, operation, callback)
    }

    pub fn request_status(&self, id: Uuid) -> Option<RequestSnapshot> {
        self.queue.request_status(id)
    }

    /// One diagnostic snapshot across all four components.
    pub async fn stats(&self) -> GatewayStats {
        GatewayStats {
            rate_limiter: self.limiter.status_all(),
            breaker: self.breaker.status(),
            queue: self.queue.status(),
            cache: self.cache.stats().await,
        }
    }

    /// Independently probe the dependency, the cache, the rate budget, and
    /// the queue. "Healthy" only when every probe passes.
    pub async fn health_check(&self) -> GatewayHealth {
        let dependency = match &self.probe_url {
            Some(url) => match self.transport.execute(HttpRequest::get(url)).await {
                Ok(response) if response.is_success() => HealthState::Healthy,
                Ok(_) => HealthState::Degraded,
                Err(_) => HealthState::Unhealthy,
            },
            None => HealthState::Healthy,
        };

        let cache = if self.cache.health_check().await.healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };

        let rate_limiter = if self.limiter.status(&self.default_endpoint).remaining > 0 {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        };

        let queue = if self.queue.is_running() {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        };

        let all_healthy = [dependency, cache, rate_limiter, queue]
            .iter()
            .all(|state| *state == HealthState::Healthy);

        GatewayHealth {
            overall: if all_healthy {
                HealthState::Healthy
            } else {
                HealthState::Degraded
            },
            dependency,
            cache,
            rate_limiter,
            queue,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn open_gateway() -> Gateway {
        Gateway::new(GatewayConfig {
            rate_limiter: RateLimiterConfig {
                requests_per_minute: 1_000,
                burst_limit: 1_000,
                ..RateLimiterConfig::default()
            },
            ..GatewayConfig::default()
        })
    }

    #[tokio::test]
    async fn cache_hit_skips_limiter_and_operation() {
        let gateway = open_gateway();
        let fetches = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let counted = Arc::clone(&fetches);
            let value = gateway
                .cached_request("quote:AAPL", None, move || async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"price": 187.32}))
                })
                .await
                .expect("request succeeds");
            assert_eq!(value["price"], 187.32);
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        // only the single miss consumed rate budget
        let status = gateway.rate_limiter().status("external_api");
        assert_eq!(status.requests_in_window, 1);
    }

    #[tokio::test]
    async fn dependency_failure_surfaces_and_trips_breaker_accounting() {
        let gateway = open_gateway();

        let err = gateway
            .cached_request("quote:FAIL", None, || async {
                Err(AccessError::dependency("upstream 503"))
            })
            .await
            .expect_err("operation failed");

        assert_eq!(err.kind(), crate::error::AccessErrorKind::Dependency);
        assert_eq!(gateway.circuit_breaker().consecutive_failures(), 1);
        // nothing was cached for the failed fetch
        assert!(!gateway.cache().exists("quote:FAIL").await);
    }

    #[tokio::test]
    async fn open_breaker_rejects_misses_but_not_hits() {
        let gateway = Gateway::new(GatewayConfig {
            breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(60),
            },
            ..GatewayConfig::default()
        });

        // seed a cached value, then trip the breaker
        gateway.cache().set("quote:AAPL", &json!(1), None).await;
        gateway.circuit_breaker().record_failure();

        let hit = gateway
            .cached_request("quote:AAPL", None, || async { Ok(json!(2)) })
            .await
            .expect("hit bypasses the breaker");
        assert_eq!(hit, json!(1));

        let err = gateway
            .cached_request("quote:MSFT", None, || async { Ok(json!(3)) })
            .await
            .expect_err("miss hits the open breaker");
        assert_eq!(err.kind(), crate::error::AccessErrorKind::BreakerOpen);
    }

    #[tokio::test]
    async fn enqueue_runs_background_operation_with_callback() {
        let gateway = open_gateway();
        gateway.start();

        let delivered = Arc::new(std::sync::Mutex::new(None));
        let sink = Arc::clone(&delivered);
        let id = gateway.enqueue(
            "external_api",
            "get_quote",
            json!({"symbol": "AAPL"}),
            Priority::High,
            None,
            Arc::new(|| -> crate::queue::OperationFuture {
                Box::pin(async { Ok(json!({"price": 10.5})) })
            }),
            Some(Box::new(move |value| {
                *sink.lock().expect("sink lock") = Some(value.clone());
            })),
        );

        for _ in 0..200 {
            if gateway
                .request_status(id)
                .map(|snapshot| snapshot.status.is_terminal())
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        gateway.stop().await;

        let snapshot = gateway.request_status(id).expect("request is tracked");
        assert_eq!(snapshot.status, crate::queue::RequestStatus::Completed);
        assert_eq!(
            delivered.lock().expect("sink lock").clone(),
            Some(json!({"price": 10.5}))
        );
    }

    #[tokio::test]
    async fn health_check_reports_healthy_when_all_probes_pass() {
        let gateway = open_gateway();
        gateway.start();

        let health = gateway.health_check().await;

        assert_eq!(health.overall, HealthState::Healthy);
        assert_eq!(health.cache, HealthState::Healthy);
        assert_eq!(health.queue, HealthState::Healthy);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn health_check_degrades_when_queue_is_stopped() {
        let gateway = open_gateway();

        let health = gateway.health_check().await;

        assert_eq!(health.queue, HealthState::Degraded);
        assert_eq!(health.overall, HealthState::Degraded);
    }

    #[tokio::test]
    async fn stats_aggregate_all_components() {
        let gateway = open_gateway();
        gateway.cache().set("k", &json!(1), None).await;
        gateway.rate_limiter().acquire("external_api");

        let stats = gateway.stats().await;

        assert_eq!(stats.cache.entries, 1);
        assert_eq!(
            stats
                .rate_limiter
                .get("external_api")
                .expect("endpoint seen")
                .requests_in_window,
            1
        );
        assert_eq!(stats.breaker.consecutive_failures, 0);
        assert!(!stats.queue.running);
    }
}
