//! # Tidegate Core
//!
//! Resilient access layer for a rate-limited, occasionally unreliable
//! upstream HTTP API.
//!
//! ## Overview
//!
//! This crate provides the foundational components for Tidegate:
//!
//! - **Sliding-window rate limiter** with independent per-endpoint buckets
//! - **Circuit breaker** isolating a degraded upstream dependency
//! - **TTL cache** with transparent compression and key normalization
//! - **Priority request queue** with a fixed worker pool and retry/backoff
//! - **Access gateway** composing all of the above behind one façade
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`backoff`] | Exponential backoff schedules with jitter |
//! | [`cache`] | TTL cache with compression and batch operations |
//! | [`circuit_breaker`] | Three-state breaker for upstream calls |
//! | [`error`] | Structured access-layer errors |
//! | [`gateway`] | Client-facing orchestration façade |
//! | [`http_client`] | HTTP transport seam (reqwest/noop) |
//! | [`queue`] | Priority queue and worker pool |
//! | [`rate_limiter`] | Sliding-window rate limiting |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tidegate_core::{Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::new(GatewayConfig::default());
//!     gateway.start();
//!
//!     // Cache-or-fetch under the shared limiter and breaker
//!     let quote = gateway
//!         .cached_request("quote:AAPL", None, || async {
//!             Ok(serde_json::json!({"price": 187.32}))
//!         })
//!         .await?;
//!
//!     println!("AAPL: {quote}");
//!     gateway.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐
//! │  Collaborators    │  (route handlers, batch jobs, CLI commands)
//! └─────────┬─────────┘
//!           │
//!           ▼
//! ┌───────────────────┐     ┌──────────────────┐
//! │  Access Gateway   │────▶│      Cache       │
//! └─────────┬─────────┘     └──────────────────┘
//!           │
//!           ▼
//! ┌───────────────────┐     ┌──────────────────┐
//! │  Request Queue    │────▶│  Rate Limiter +  │
//! │  (worker pool)    │     │  Circuit Breaker │
//! └───────────────────┘     └──────────────────┘
//! ```
//!
//! Data flows strictly downward; no component depends upward.
//!
//! ## Error Handling
//!
//! All operations return `Result` types with structured errors:
//!
//! ```rust
//! use tidegate_core::{AccessError, AccessErrorKind};
//!
//! fn handle_error(error: AccessError) {
//!     match error.kind() {
//!         AccessErrorKind::RateLimited => {
//!             // wait and retry
//!         }
//!         AccessErrorKind::BreakerOpen => {
//!             // upstream is degraded, no attempt was made
//!         }
//!         AccessErrorKind::Dependency => {
//!             // the attempt itself failed
//!         }
//!         _ => {}
//!     }
//! }
//! ```

pub mod backoff;
pub mod cache;
pub mod circuit_breaker;
pub mod error;
pub mod gateway;
pub mod http_client;
pub mod queue;
pub mod rate_limiter;

// Re-export commonly used types at crate root for convenience

// Backoff schedules
pub use backoff::BackoffPolicy;

// Cache
pub use cache::{Cache, CacheConfig, CacheHealth, CacheStats};

// Circuit breaker
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState,
};

// Error types
pub use error::{AccessError, AccessErrorKind, CacheError};

// Gateway façade
pub use gateway::{Gateway, GatewayConfig, GatewayHealth, GatewayStats, HealthState};

// HTTP transport
pub use http_client::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, NoopHttpClient, ReqwestHttpClient,
};

// Request queue
pub use queue::{
    Callback, Operation, OperationFuture, OperationResult, Priority, QueueConfig, QueueDepths,
    QueueStatus, QueuedRequest, RequestQueue, RequestSnapshot, RequestStatus,
};

// Rate limiting
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStatus};
