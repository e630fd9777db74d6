//! Fault-tolerance primitives for wrapping synchronous and asynchronous calls
//! with runtime policies.
//!
//! `breakwater` provides five guard primitives and the registry that hosts
//! them:
//! - **Circuit breaker**: a concurrent state machine over a sliding window of
//!   call outcomes that stops calling a failing dependency.
//! - **Rate limiter**: atomic token accounting over fixed refresh cycles with
//!   bounded permit reservation.
//! - **Bulkhead**: a counting semaphore enforcing a concurrency cap, plus a
//!   worker-pool variant with a bounded queue.
//! - **Retry**: a per-invocation context driving bounded re-execution with
//!   configurable backoff.
//! - **Time limiter**: a bounded wait around a future producer with optional
//!   cancel-on-timeout.
//!
//! Every primitive hands the caller a permission protocol
//! (`try_acquire_permission` / `acquire_permission` / outcome callbacks) and a
//! decorator surface (`call` / `execute`) built on top of it, publishes typed
//! lifecycle events, and exposes a metrics snapshot. Instances are located by
//! name through [`registry::Registry`] and its per-primitive facades.
//!
//! State is process-local; nothing is persisted or distributed.
//!
//! # Example
//!
//! ```rust
//! use breakwater::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::of("backend", CircuitBreakerConfig::default());
//!
//! let value = breaker.execute(|| async { Ok::<_, std::io::Error>(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod event;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod thread_pool_bulkhead;
pub mod time_limiter;
pub mod utils;

// Re-export the types most embedders touch.
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadRegistry};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, State,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{ConfigError, GuardError};
pub use event::{EventPublisher, EventSubscription};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterRegistry};
pub use registry::Registry;
pub use retry::{IntervalFunction, Retry, RetryConfig, RetryRegistry};
pub use thread_pool_bulkhead::{
    ThreadPoolBulkhead, ThreadPoolBulkheadConfig, ThreadPoolBulkheadRegistry,
};
pub use time_limiter::{TimeLimiter, TimeLimiterConfig, TimeLimiterRegistry};
