//! Error types for the limiter, dispatcher and batch consumer.
use std::time::Duration;

/// Boxed error used for failures raised by foreign code (stores, backends, streams, handlers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures raised by a counter store.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached or rejected the request.
    #[error("counter store unavailable: {0}")]
    Unavailable(#[source] BoxError),
    /// Optimistic commits kept losing races and the retry budget ran out.
    #[error("counter store contention: gave up after {attempts} compare-and-swap attempts")]
    Contention {
        /// Number of compare-and-swap attempts made.
        attempts: usize,
    },
    /// Stored window state could not be interpreted.
    #[error("corrupt window state: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Wrap an arbitrary transport failure as [`StoreError::Unavailable`].
    pub fn unavailable<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        StoreError::Unavailable(err.into())
    }
}

/// Errors returned by [`RateLimiter::limit`](crate::rate_limit::RateLimiter::limit).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum LimiterError {
    /// The counter store failed; the limiter does not guess a decision.
    #[error("rate limiter store unavailable for key '{key}': {source}")]
    StoreUnavailable {
        /// Bucket that was being evaluated.
        key: String,
        /// Underlying store failure.
        #[source]
        source: StoreError,
    },
    /// Rate keys must be non-empty.
    #[error("rate key must not be empty")]
    EmptyKey,
}

/// Errors returned by [`FailoverDispatcher::send`](crate::failover::FailoverDispatcher::send).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    /// The admission budget is exhausted; no backend was attempted.
    #[error("rate limited; retry after {wait:?}")]
    RateLimited {
        /// Time until the oldest event in the window expires.
        wait: Duration,
    },
    /// The limiter failed and the dispatcher is configured to fail closed.
    #[error("rate limiter unavailable: {0}")]
    LimiterUnavailable(#[source] LimiterError),
    /// The attempt exceeded the per-attempt deadline.
    #[error("backend '{backend}' timed out after {elapsed:?} (limit: {timeout:?})")]
    BackendTimeout {
        /// Name of the backend that was attempted.
        backend: String,
        /// Time spent before the attempt was abandoned.
        elapsed: Duration,
        /// Configured per-attempt timeout.
        timeout: Duration,
    },
    /// The backend reported a failure.
    #[error("backend '{backend}' failed: {source}")]
    Backend {
        /// Name of the backend that was attempted.
        backend: String,
        /// Failure reported by the backend.
        #[source]
        source: BoxError,
    },
}

impl DispatchError {
    /// Check if this error is due to the admission budget.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error is due to the limiter failing closed.
    pub fn is_limiter_unavailable(&self) -> bool {
        matches!(self, Self::LimiterUnavailable(_))
    }

    /// Check if this error is due to a per-attempt timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::BackendTimeout { .. })
    }

    /// Check if this error came from a delivery attempt (timeout or backend failure).
    pub fn is_delivery_failure(&self) -> bool {
        matches!(self, Self::BackendTimeout { .. } | Self::Backend { .. })
    }

    /// Name of the backend involved, if any was attempted.
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::BackendTimeout { backend, .. } | Self::Backend { backend, .. } => Some(backend),
            _ => None,
        }
    }

    /// Suggested wait before retrying a rate-limited send.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait } => Some(*wait),
            _ => None,
        }
    }
}

/// A record payload that could not be decoded. Logged by the consumer, never fatal.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DecodeError {
    /// The record carried no payload bytes.
    #[error("record has no payload")]
    MissingPayload,
    /// The payload bytes were malformed for the target type.
    #[error("malformed payload: {0}")]
    Malformed(#[source] BoxError),
}

/// Fatal errors that stop a batch consumer loop.
///
/// Stream closure and shutdown are not errors; `run` returns `Ok(())` for both.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConsumerError {
    /// Reading from or acknowledging on the stream failed.
    #[error("record stream failed: {0}")]
    Stream(#[source] BoxError),
}

/// Invalid configuration values.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Window duration must be non-zero.
    #[error("window must be > 0")]
    ZeroWindow,
    /// Threshold must be non-zero.
    #[error("threshold must be > 0")]
    ZeroThreshold,
    /// Failure threshold must be non-zero.
    #[error("failure_threshold must be > 0")]
    ZeroFailureThreshold,
    /// Timeouts must be non-zero and finite.
    #[error("timeout must be non-zero and finite (got {0:?})")]
    InvalidTimeout(Duration),
    /// At least one backend is required.
    #[error("at least one backend is required")]
    NoBackends,
    /// Batch size must be non-zero.
    #[error("batch_size must be > 0")]
    ZeroBatchSize,
    /// Batch window must be non-zero.
    #[error("batch_window must be > 0")]
    ZeroBatchWindow,
    /// Compare-and-swap retry budget must be non-zero.
    #[error("max_attempts must be > 0")]
    ZeroAttempts,
}
