// Test library for access-layer behavior tests
pub use std::sync::Arc;
pub use tidegate_core::{
    AccessError, AccessErrorKind, BackoffPolicy, CircuitBreakerConfig, CircuitState, Gateway,
    GatewayConfig, HealthState, Operation, OperationFuture, Priority, QueueConfig,
    RateLimiterConfig, RequestStatus,
};
