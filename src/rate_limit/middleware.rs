//! Tower middleware that admits requests through a [`RateLimiter`].
//!
//! Each request is mapped to a limiter key by a [`KeyExtractor`]. The limiter is asked once per
//! call; denied requests never reach the inner service.
//!
//! ```
//! use courier::rate_limit::store::InMemoryCounterStore;
//! use courier::rate_limit::{PrefixedKey, RateLimitLayer, SlidingWindowConfig, SlidingWindowLimiter};
//! use std::time::Duration;
//! use tower::ServiceBuilder;
//!
//! struct Request {
//!     client_ip: String,
//! }
//!
//! let config = SlidingWindowConfig::new(Duration::from_secs(1), 100).unwrap();
//! let limiter = SlidingWindowLimiter::new(InMemoryCounterStore::new(), config);
//! let layer = RateLimitLayer::new(limiter, PrefixedKey::new(|req: &Request| req.client_ip.clone()));
//!
//! let svc = ServiceBuilder::new()
//!     .layer(layer)
//!     .service_fn(|req: Request| async move { Ok::<_, std::io::Error>(req.client_ip) });
//! # let _ = svc;
//! ```

use crate::error::LimiterError;
use crate::rate_limit::{Decision, RateLimiter, StoreFailurePolicy};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Default key prefix for per-client limits.
pub const DEFAULT_KEY_PREFIX: &str = "ip-limiter";

/// Maps a request to the limiter key it is counted against.
pub trait KeyExtractor<Req>: Send + Sync + 'static {
    fn key(&self, req: &Req) -> String;
}

/// `"<prefix>:<suffix>"` where the suffix is derived from the request (typically a client IP).
#[derive(Clone)]
pub struct PrefixedKey<F> {
    prefix: Arc<str>,
    suffix: F,
}

impl<F> PrefixedKey<F> {
    /// Keys of the form `ip-limiter:<suffix>`.
    pub fn new(suffix: F) -> Self {
        Self { prefix: Arc::from(DEFAULT_KEY_PREFIX), suffix }
    }

    /// Replace the default prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Arc::from(prefix.into());
        self
    }
}

impl<F> std::fmt::Debug for PrefixedKey<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixedKey").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

impl<Req, F> KeyExtractor<Req> for PrefixedKey<F>
where
    F: Fn(&Req) -> String + Send + Sync + 'static,
{
    fn key(&self, req: &Req) -> String {
        format!("{}:{}", self.prefix, (self.suffix)(req))
    }
}

/// Every request shares one bucket.
#[derive(Clone, Debug)]
pub struct FixedKey(Arc<str>);

impl FixedKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Arc::from(key.into()))
    }
}

impl<Req> KeyExtractor<Req> for FixedKey {
    fn key(&self, _req: &Req) -> String {
        self.0.to_string()
    }
}

/// Errors produced by [`RateLimitService`].
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError<E> {
    /// The request's bucket is full.
    #[error("rate limited; retry after {wait:?}")]
    Limited { wait: Duration },
    /// The limiter could not decide and the layer fails closed.
    #[error("rate limiter unavailable: {0}")]
    Unavailable(#[source] LimiterError),
    /// The inner service failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> RateLimitError<E> {
    pub fn is_limited(&self) -> bool {
        matches!(self, RateLimitError::Limited { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, RateLimitError::Unavailable(_))
    }

    /// Suggested `Retry-After` for limited requests.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitError::Limited { wait } => Some(*wait),
            _ => None,
        }
    }
}

/// A layer that enforces rate limits using a [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimitLayer<L, K> {
    limiter: Arc<L>,
    extractor: Arc<K>,
    on_limiter_error: StoreFailurePolicy,
}

impl<L, K> Clone for RateLimitLayer<L, K> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            on_limiter_error: self.on_limiter_error,
        }
    }
}

impl<L, K> RateLimitLayer<L, K> {
    /// Create a new rate limit layer that fails closed.
    pub fn new(limiter: L, extractor: K) -> Self {
        Self::from_shared(Arc::new(limiter), extractor)
    }

    /// Share one limiter between several layers.
    pub fn from_shared(limiter: Arc<L>, extractor: K) -> Self {
        Self {
            limiter,
            extractor: Arc::new(extractor),
            on_limiter_error: StoreFailurePolicy::default(),
        }
    }

    /// What to do when the limiter itself errors.
    pub fn on_limiter_error(mut self, policy: StoreFailurePolicy) -> Self {
        self.on_limiter_error = policy;
        self
    }
}

impl<S, L, K> Layer<S> for RateLimitLayer<L, K> {
    type Service = RateLimitService<S, L, K>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, layer: self.clone() }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Debug)]
pub struct RateLimitService<S, L, K> {
    inner: S,
    layer: RateLimitLayer<L, K>,
}

impl<S: Clone, L, K> Clone for RateLimitService<S, L, K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S, L, K, Req> Service<Req> for RateLimitService<S, L, K>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    L: RateLimiter + 'static,
    K: KeyExtractor<Req>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = RateLimitError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(RateLimitError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = self.layer.extractor.key(&req);
        let limiter = self.layer.limiter.clone();
        let policy = self.layer.on_limiter_error;
        // Drive the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match limiter.limit(&key).await {
                Ok(Decision::Allowed { .. }) => {}
                Ok(Decision::Denied { wait }) => return Err(RateLimitError::Limited { wait }),
                Err(err) => match policy {
                    StoreFailurePolicy::FailClosed => {
                        tracing::error!(
                            target: "courier::rate_limit",
                            key = %key,
                            error = %err,
                            "limiter failed; rejecting request"
                        );
                        return Err(RateLimitError::Unavailable(err));
                    }
                    StoreFailurePolicy::FailOpen => {
                        tracing::warn!(
                            target: "courier::rate_limit",
                            key = %key,
                            error = %err,
                            "limiter failed; admitting request"
                        );
                    }
                },
            }
            inner.call(req).await.map_err(RateLimitError::Inner)
        })
    }
}
