//! Distributed admission control.
//!
//! This module provides the building blocks for rate limiting across a fleet:
//! - [`RateLimiter`]: the core trait, answering "is this key over budget?".
//! - [`SlidingWindowLimiter`]: sliding-window log limiter over a shared [`CounterStore`].
//! - [`RateLimitLayer`]: Tower middleware that enforces a limiter per request key.
//! - [`Decision`]: the result of a check (Allowed/Denied).
//!
//! # Architecture
//!
//! - **Middleware / dispatcher**: ask a `RateLimiter`; they don't know how limiting works.
//! - **Logic**: `SlidingWindowLimiter` owns the window and threshold and the clock.
//! - **Storage**: a `CounterStore` evaluates one window atomically. Stores with a lock or
//!   server-side scripting implement it directly; stores that only offer compare-and-swap
//!   implement [`WindowStore`] and are wrapped in [`OptimisticCounterStore`].
//!
//! [`CounterStore`]: store::CounterStore
//! [`WindowStore`]: store::WindowStore
//! [`OptimisticCounterStore`]: store::OptimisticCounterStore

use crate::error::LimiterError;
use std::sync::Arc;
use std::time::Duration;

pub mod middleware;
pub mod sliding_window;
pub mod store;
pub use middleware::{FixedKey, KeyExtractor, PrefixedKey, RateLimitError, RateLimitLayer, RateLimitService};
pub use sliding_window::{SlidingWindowConfig, SlidingWindowLimiter};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The event was admitted and recorded.
    Allowed {
        /// Slots left in the window after this event.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u32,
    },
    /// The event was denied and not recorded.
    Denied {
        /// How long until the oldest event leaves the window.
        /// Useful for `Retry-After` headers.
        wait: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Helper to check if limited (the inverse of [`is_allowed`](Self::is_allowed)).
    pub fn is_limited(&self) -> bool {
        !self.is_allowed()
    }
}

/// What callers of a limiter do when the limiter itself fails.
///
/// `FailClosed` treats an unreachable store as "limited" to protect downstream capacity.
/// `FailOpen` lets traffic through for deployments that prioritize availability over the
/// budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StoreFailurePolicy {
    /// Reject the operation when the limiter errors.
    #[default]
    FailClosed,
    /// Proceed without admission control when the limiter errors.
    FailOpen,
}

/// Core interface for admission control.
///
/// Implementations must be safe to call concurrently from many tasks.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether one more event for `key` fits in its budget, recording it if so.
    async fn limit(&self, key: &str) -> Result<Decision, LimiterError>;
}

#[async_trait::async_trait]
impl<L> RateLimiter for Arc<L>
where
    L: RateLimiter + ?Sized,
{
    async fn limit(&self, key: &str) -> Result<Decision, LimiterError> {
        (**self).limit(key).await
    }
}
