#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Courier
//!
//! Delivery plumbing for notification services: fleet-wide rate limiting, failover across
//! notification providers, and timeout-bounded batch consumption of message streams.
//!
//! ## Features
//!
//! - **Sliding-window rate limiting** over a shared counter store, atomic per call
//!   (lock-based in memory, compare-and-swap for external stores)
//! - **Failover dispatch** that demotes a provider after consecutive failures or timeouts
//! - **Batch consumption** bounded by size and time, acknowledging only after handling
//! - **Tower middleware** for per-client limits in front of any service
//! - **Telemetry** via pluggable sinks, plus `tracing` logs throughout
//!
//! ## Quick Start
//!
//! ```rust
//! use courier::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = SlidingWindowLimiter::new(
//!         InMemoryCounterStore::new(),
//!         SlidingWindowConfig::new(Duration::from_secs(1), 1000).unwrap(),
//!     );
//!
//!     let sms = FailoverDispatcher::builder(limiter)
//!         .backend(Arc::new(LogBackend::new("provider-a")))
//!         .backend(Arc::new(LogBackend::new("provider-b")))
//!         .attempt_timeout(Duration::from_secs(2))
//!         .build()
//!         .unwrap();
//!
//!     match sms.send(&Notification::new("verify", ["4821"], ["+15550100"])).await {
//!         Ok(()) => {}
//!         Err(e) if e.is_rate_limited() => println!("slow down: {:?}", e.retry_after()),
//!         Err(e) => println!("delivery failed: {e}"),
//!     }
//! }
//! ```

pub mod batch;
pub mod clock;
pub mod error;
pub mod failover;
pub mod prelude;
pub mod rate_limit;
pub mod telemetry;
pub mod timeout;
pub mod tunable;

// Re-exports
pub use batch::{
    Batch, BatchConfig, BatchConsumer, BatchConsumerBuilder, BatchHandler, EmptyBatchPolicy,
};
pub use clock::{Clock, SystemClock};
pub use error::{
    BoxError, ConfigError, ConsumerError, DecodeError, DispatchError, LimiterError, StoreError,
};
pub use failover::{
    Backend, DispatcherConfig, FailoverDispatcher, FailoverDispatcherBuilder, FailoverSnapshot,
    LogBackend, Notification,
};
pub use rate_limit::{
    Decision, RateLimiter, SlidingWindowConfig, SlidingWindowLimiter, StoreFailurePolicy,
};
pub use timeout::TimeoutPolicy;
pub use tunable::Tunable;
