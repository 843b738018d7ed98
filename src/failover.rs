//! Failover-aware notification dispatch.
//!
//! A [`FailoverDispatcher`] routes each [`Notification`] to the *active* backend of an ordered
//! list. Every send is first admitted by a shared [`RateLimiter`] under one fixed key. When the
//! active backend fails or times out `failure_threshold` times in a row it is demoted and the
//! next backend (cyclically) becomes active.
//!
//! ```
//! use courier::failover::{FailoverDispatcher, LogBackend, Notification};
//! use courier::rate_limit::store::InMemoryCounterStore;
//! use courier::rate_limit::{SlidingWindowConfig, SlidingWindowLimiter};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = SlidingWindowLimiter::new(
//!     InMemoryCounterStore::new(),
//!     SlidingWindowConfig::new(Duration::from_secs(1), 1000).unwrap(),
//! );
//! let dispatcher = FailoverDispatcher::builder(limiter)
//!     .backend(Arc::new(LogBackend::new("primary")))
//!     .backend(Arc::new(LogBackend::new("secondary")))
//!     .failure_threshold(3)
//!     .build()
//!     .unwrap();
//!
//! let sms = Notification::new("login-code", ["123456"], ["+15550100"]);
//! dispatcher.send(&sms).await.unwrap();
//! # }
//! ```

use crate::error::{BoxError, ConfigError, DispatchError};
use crate::rate_limit::{Decision, RateLimiter, StoreFailurePolicy};
use crate::telemetry::{emit_best_effort, CourierEvent, FailoverEvent, NullSink, TelemetrySink};
use crate::timeout::{TimedOut, TimeoutPolicy};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Limiter key shared by every dispatcher that sends through the same budget.
pub const DEFAULT_LIMITER_KEY: &str = "sms-limiter";
/// Consecutive failures that demote the active backend.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 3;
/// Deadline for one delivery attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// One outbound message: a provider template, its arguments and the recipients.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Notification {
    /// Provider-side template id.
    pub template: String,
    /// Positional template arguments.
    pub args: Vec<String>,
    /// Destination addresses (phone numbers for SMS).
    pub recipients: Vec<String>,
}

impl Notification {
    pub fn new<A, R>(
        template: impl Into<String>,
        args: impl IntoIterator<Item = A>,
        recipients: impl IntoIterator<Item = R>,
    ) -> Self
    where
        A: Into<String>,
        R: Into<String>,
    {
        Self {
            template: template.into(),
            args: args.into_iter().map(Into::into).collect(),
            recipients: recipients.into_iter().map(Into::into).collect(),
        }
    }
}

/// A notification provider.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Deliver `notification`. Must be safe to drop mid-flight (the dispatcher's deadline
    /// abandons the future).
    async fn send(&self, notification: &Notification) -> Result<(), BoxError>;
}

#[async_trait]
impl<B> Backend for Arc<B>
where
    B: Backend + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn send(&self, notification: &Notification) -> Result<(), BoxError> {
        (**self).send(notification).await
    }
}

/// Backend that only logs what it would send. Always succeeds.
#[derive(Debug, Clone)]
pub struct LogBackend {
    name: String,
}

impl LogBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogBackend {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl Backend for LogBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), BoxError> {
        tracing::info!(
            target: "courier::failover",
            backend = %self.name,
            template = %notification.template,
            args = ?notification.args,
            recipients = ?notification.recipients,
            "notification logged"
        );
        Ok(())
    }
}

/// Validated dispatcher settings. Deserializing goes through [`DispatcherConfig::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawDispatcherConfig"))]
pub struct DispatcherConfig {
    failure_threshold: usize,
    attempt_timeout: Duration,
    limiter_key: String,
    on_limiter_error: StoreFailurePolicy,
}

#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawDispatcherConfig {
    failure_threshold: usize,
    attempt_timeout: Duration,
    #[serde(default = "default_limiter_key")]
    limiter_key: String,
    #[serde(default)]
    on_limiter_error: StoreFailurePolicy,
}

#[cfg(feature = "serde")]
fn default_limiter_key() -> String {
    DEFAULT_LIMITER_KEY.to_string()
}

#[cfg(feature = "serde")]
impl TryFrom<RawDispatcherConfig> for DispatcherConfig {
    type Error = ConfigError;

    fn try_from(raw: RawDispatcherConfig) -> Result<Self, Self::Error> {
        Ok(Self::new(raw.failure_threshold, raw.attempt_timeout)?
            .with_limiter_key(raw.limiter_key)
            .with_limiter_failure_policy(raw.on_limiter_error))
    }
}

impl DispatcherConfig {
    /// `failure_threshold` must be > 0; `attempt_timeout` must be non-zero and finite.
    pub fn new(failure_threshold: usize, attempt_timeout: Duration) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        TimeoutPolicy::new(attempt_timeout)?;
        Ok(Self {
            failure_threshold,
            attempt_timeout,
            limiter_key: DEFAULT_LIMITER_KEY.to_string(),
            on_limiter_error: StoreFailurePolicy::default(),
        })
    }

    /// Bucket the dispatcher is admitted under.
    pub fn with_limiter_key(mut self, key: impl Into<String>) -> Self {
        self.limiter_key = key.into();
        self
    }

    /// What to do when the limiter errors.
    pub fn with_limiter_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.on_limiter_error = policy;
        self
    }

    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub fn limiter_key(&self) -> &str {
        &self.limiter_key
    }

    pub fn limiter_failure_policy(&self) -> StoreFailurePolicy {
        self.on_limiter_error
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            limiter_key: DEFAULT_LIMITER_KEY.to_string(),
            on_limiter_error: StoreFailurePolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
struct FailoverState {
    active: usize,
    consecutive_failures: usize,
}

/// Point-in-time view of the rotation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverSnapshot {
    /// Index of the backend that receives the next send.
    pub active: usize,
    /// Failure streak of the active backend.
    pub consecutive_failures: usize,
}

enum Recorded {
    Stale,
    Counted { streak: usize, demoted_to: Option<usize> },
}

/// Rate-limited dispatcher that rotates away from failing backends.
pub struct FailoverDispatcher<L, K = NullSink> {
    backends: Vec<Arc<dyn Backend>>,
    limiter: L,
    config: DispatcherConfig,
    timeout: TimeoutPolicy,
    state: Mutex<FailoverState>,
    sink: K,
}

impl<L> FailoverDispatcher<L, NullSink>
where
    L: RateLimiter,
{
    /// Rejects an empty backend list.
    pub fn new(
        backends: Vec<Arc<dyn Backend>>,
        limiter: L,
        config: DispatcherConfig,
    ) -> Result<Self, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        if config.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        let timeout = TimeoutPolicy::new(config.attempt_timeout)?;
        Ok(Self {
            backends,
            limiter,
            config,
            timeout,
            state: Mutex::new(FailoverState::default()),
            sink: NullSink,
        })
    }

    pub fn builder(limiter: L) -> FailoverDispatcherBuilder<L> {
        FailoverDispatcherBuilder::new(limiter)
    }
}

impl<L, K> FailoverDispatcher<L, K>
where
    L: RateLimiter,
    K: TelemetrySink,
{
    /// Attach a telemetry sink.
    pub fn with_sink<K2: TelemetrySink>(self, sink: K2) -> FailoverDispatcher<L, K2> {
        FailoverDispatcher {
            backends: self.backends,
            limiter: self.limiter,
            config: self.config,
            timeout: self.timeout,
            state: self.state,
            sink,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn snapshot(&self) -> FailoverSnapshot {
        let state = self.lock();
        FailoverSnapshot { active: state.active, consecutive_failures: state.consecutive_failures }
    }

    fn lock(&self) -> MutexGuard<'_, FailoverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit, then attempt the active backend once under the per-attempt deadline.
    ///
    /// No backend is attempted when the limiter denies (or errors while failing closed). A
    /// failed attempt is returned as-is; the next call goes to whichever backend is active
    /// by then.
    ///
    /// A nested dispatcher that refuses admission is passed through as
    /// [`DispatchError::RateLimited`] (or `LimiterUnavailable`) and does not count toward
    /// demotion.
    pub async fn send(&self, notification: &Notification) -> Result<(), DispatchError> {
        self.admit().await?;

        let (index, backend) = {
            let state = self.lock();
            (state.active, self.backends[state.active].clone())
        };

        let start = Instant::now();
        match self.timeout.run(backend.send(notification)).await {
            Ok(Ok(())) => {
                self.record_success(index);
                emit_best_effort(
                    self.sink.clone(),
                    CourierEvent::Failover(FailoverEvent::Delivered {
                        backend: index,
                        duration: start.elapsed(),
                    }),
                )
                .await;
                Ok(())
            }
            Ok(Err(source)) => {
                let source = match source.downcast::<DispatchError>() {
                    // A nested dispatcher refusing admission is not a delivery failure.
                    Ok(inner) if inner.is_rate_limited() || inner.is_limiter_unavailable() => {
                        tracing::debug!(
                            target: "courier::failover",
                            backend = backend.name(),
                            index,
                            error = %inner,
                            "nested dispatcher refused admission; not counted as a failure"
                        );
                        return Err(*inner);
                    }
                    Ok(inner) => inner as BoxError,
                    Err(source) => source,
                };
                tracing::warn!(
                    target: "courier::failover",
                    backend = backend.name(),
                    index,
                    error = %source,
                    "delivery attempt failed"
                );
                self.on_failure(index, backend.name(), false).await;
                Err(DispatchError::Backend { backend: backend.name().to_string(), source })
            }
            Err(TimedOut { elapsed, timeout }) => {
                tracing::warn!(
                    target: "courier::failover",
                    backend = backend.name(),
                    index,
                    ?elapsed,
                    "delivery attempt timed out"
                );
                self.on_failure(index, backend.name(), true).await;
                Err(DispatchError::BackendTimeout {
                    backend: backend.name().to_string(),
                    elapsed,
                    timeout,
                })
            }
        }
    }

    async fn admit(&self) -> Result<(), DispatchError> {
        match self.limiter.limit(&self.config.limiter_key).await {
            Ok(Decision::Allowed { .. }) => Ok(()),
            Ok(Decision::Denied { wait }) => Err(DispatchError::RateLimited { wait }),
            Err(err) => match self.config.on_limiter_error {
                StoreFailurePolicy::FailClosed => {
                    tracing::error!(
                        target: "courier::failover",
                        key = %self.config.limiter_key,
                        error = %err,
                        "limiter unavailable; refusing to send"
                    );
                    Err(DispatchError::LimiterUnavailable(err))
                }
                StoreFailurePolicy::FailOpen => {
                    tracing::warn!(
                        target: "courier::failover",
                        key = %self.config.limiter_key,
                        error = %err,
                        "limiter unavailable; sending without admission"
                    );
                    emit_best_effort(
                        self.sink.clone(),
                        CourierEvent::Failover(FailoverEvent::LimiterBypassed),
                    )
                    .await;
                    Ok(())
                }
            },
        }
    }

    fn record_success(&self, index: usize) {
        let mut state = self.lock();
        if state.active == index {
            state.consecutive_failures = 0;
        }
    }

    fn record_failure(&self, index: usize) -> Recorded {
        let mut state = self.lock();
        if state.active != index {
            return Recorded::Stale;
        }
        state.consecutive_failures += 1;
        let streak = state.consecutive_failures;
        if streak < self.config.failure_threshold {
            return Recorded::Counted { streak, demoted_to: None };
        }
        state.active = (index + 1) % self.backends.len();
        state.consecutive_failures = 0;
        Recorded::Counted { streak, demoted_to: Some(state.active) }
    }

    async fn on_failure(&self, index: usize, name: &str, timed_out: bool) {
        let (streak, demoted_to) = match self.record_failure(index) {
            Recorded::Stale => {
                tracing::debug!(
                    target: "courier::failover",
                    backend = name,
                    index,
                    "ignoring outcome for a backend that is no longer active"
                );
                return;
            }
            Recorded::Counted { streak, demoted_to } => (streak, demoted_to),
        };

        emit_best_effort(
            self.sink.clone(),
            CourierEvent::Failover(FailoverEvent::AttemptFailed {
                backend: index,
                consecutive_failures: streak,
                timed_out,
            }),
        )
        .await;

        if let Some(to) = demoted_to {
            tracing::error!(
                target: "courier::failover",
                backend = name,
                from = index,
                to,
                failures = streak,
                "backend demoted"
            );
            emit_best_effort(
                self.sink.clone(),
                CourierEvent::Failover(FailoverEvent::Demoted { from: index, to }),
            )
            .await;
        }
    }
}

impl<L, K> std::fmt::Debug for FailoverDispatcher<L, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        f.debug_struct("FailoverDispatcher")
            .field("backends", &names)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<L, K> Backend for FailoverDispatcher<L, K>
where
    L: RateLimiter,
    K: TelemetrySink,
{
    fn name(&self) -> &str {
        "failover"
    }

    async fn send(&self, notification: &Notification) -> Result<(), BoxError> {
        FailoverDispatcher::send(self, notification).await.map_err(Into::into)
    }
}

/// Builder for [`FailoverDispatcher`].
pub struct FailoverDispatcherBuilder<L> {
    limiter: L,
    backends: Vec<Arc<dyn Backend>>,
    failure_threshold: usize,
    attempt_timeout: Duration,
    limiter_key: String,
    on_limiter_error: StoreFailurePolicy,
}

impl<L> FailoverDispatcherBuilder<L>
where
    L: RateLimiter,
{
    pub fn new(limiter: L) -> Self {
        Self {
            limiter,
            backends: Vec::new(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            limiter_key: DEFAULT_LIMITER_KEY.to_string(),
            on_limiter_error: StoreFailurePolicy::default(),
        }
    }

    /// Append a backend; order is failover order.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn backends(mut self, backends: impl IntoIterator<Item = Arc<dyn Backend>>) -> Self {
        self.backends.extend(backends);
        self
    }

    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn limiter_key(mut self, key: impl Into<String>) -> Self {
        self.limiter_key = key.into();
        self
    }

    pub fn on_limiter_error(mut self, policy: StoreFailurePolicy) -> Self {
        self.on_limiter_error = policy;
        self
    }

    pub fn build(self) -> Result<FailoverDispatcher<L>, ConfigError> {
        let config = DispatcherConfig::new(self.failure_threshold, self.attempt_timeout)?
            .with_limiter_key(self.limiter_key)
            .with_limiter_failure_policy(self.on_limiter_error);
        FailoverDispatcher::new(self.backends, self.limiter, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimiterError;
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Unlimited;

    #[async_trait]
    impl RateLimiter for Unlimited {
        async fn limit(&self, _key: &str) -> Result<Decision, LimiterError> {
            Ok(Decision::Allowed { remaining: u32::MAX })
        }
    }

    #[derive(Default)]
    struct Flaky {
        fail: std::sync::atomic::AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Backend for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, _n: &Notification) -> Result<(), BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err("provider rejected".into())
            } else {
                Ok(())
            }
        }
    }

    fn notification() -> Notification {
        Notification::new("tpl", ["1"], ["+15550100"])
    }

    #[test]
    fn config_validation() {
        assert_eq!(
            DispatcherConfig::new(0, Duration::from_secs(1)),
            Err(ConfigError::ZeroFailureThreshold)
        );
        assert_eq!(
            DispatcherConfig::new(1, Duration::ZERO),
            Err(ConfigError::InvalidTimeout(Duration::ZERO))
        );
        let config = DispatcherConfig::default();
        assert_eq!(config.failure_threshold(), 3);
        assert_eq!(config.limiter_key(), "sms-limiter");
        assert_eq!(config.limiter_failure_policy(), StoreFailurePolicy::FailClosed);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializing_validates() {
        let zero = r#"{"failure_threshold":0,"attempt_timeout":{"secs":5,"nanos":0}}"#;
        assert!(serde_json::from_str::<DispatcherConfig>(zero).is_err());

        let no_timeout = r#"{"failure_threshold":3,"attempt_timeout":{"secs":0,"nanos":0}}"#;
        assert!(serde_json::from_str::<DispatcherConfig>(no_timeout).is_err());

        let loaded: DispatcherConfig = serde_json::from_str(
            r#"{"failure_threshold":2,"attempt_timeout":{"secs":1,"nanos":0},"on_limiter_error":"fail_open"}"#,
        )
        .unwrap();
        assert_eq!(loaded.failure_threshold(), 2);
        assert_eq!(loaded.limiter_key(), DEFAULT_LIMITER_KEY);
        assert_eq!(loaded.limiter_failure_policy(), StoreFailurePolicy::FailOpen);
    }

    #[test]
    fn rejects_empty_backend_list() {
        let err = FailoverDispatcher::builder(Unlimited).build().unwrap_err();
        assert_eq!(err, ConfigError::NoBackends);
    }

    #[tokio::test]
    async fn success_resets_the_streak() {
        let backend = Arc::new(Flaky::default());
        let dispatcher = FailoverDispatcher::builder(Unlimited)
            .backend(backend.clone())
            .backend(Arc::new(LogBackend::default()))
            .failure_threshold(2)
            .build()
            .unwrap();

        backend.fail.store(true, Ordering::SeqCst);
        assert!(dispatcher.send(&notification()).await.unwrap_err().is_delivery_failure());
        assert_eq!(dispatcher.snapshot().consecutive_failures, 1);

        backend.fail.store(false, Ordering::SeqCst);
        dispatcher.send(&notification()).await.unwrap();
        assert_eq!(dispatcher.snapshot(), FailoverSnapshot { active: 0, consecutive_failures: 0 });
    }

    #[test]
    fn stale_outcomes_are_ignored() {
        let backend = Arc::new(Flaky::default());
        let dispatcher = FailoverDispatcher::builder(Unlimited)
            .backend(backend)
            .backend(Arc::new(LogBackend::default()))
            .failure_threshold(1)
            .build()
            .unwrap();

        let first = dispatcher.record_failure(0);
        assert!(matches!(first, Recorded::Counted { demoted_to: Some(1), .. }));
        // A second failure for backend 0 that raced with the first must not rotate again.
        assert!(matches!(dispatcher.record_failure(0), Recorded::Stale));
        assert_eq!(dispatcher.snapshot().active, 1);
    }

    #[tokio::test]
    async fn demotion_is_reported() {
        let backend = Arc::new(Flaky::default());
        backend.fail.store(true, Ordering::SeqCst);
        let sink = MemorySink::new();
        let dispatcher = FailoverDispatcher::builder(Unlimited)
            .backend(backend)
            .backend(Arc::new(LogBackend::default()))
            .failure_threshold(1)
            .build()
            .unwrap()
            .with_sink(sink.clone());

        let _ = dispatcher.send(&notification()).await;
        assert_eq!(
            sink.events(),
            vec![
                CourierEvent::Failover(FailoverEvent::AttemptFailed {
                    backend: 0,
                    consecutive_failures: 1,
                    timed_out: false,
                }),
                CourierEvent::Failover(FailoverEvent::Demoted { from: 0, to: 1 }),
            ]
        );
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<std::sync::Mutex<Vec<u8>>>);

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<std::sync::Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn demotion_is_logged_at_error() {
        let buffer = Arc::new(std::sync::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(SharedWriter(buffer.clone()))
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let backend = Arc::new(Flaky::default());
        backend.fail.store(true, Ordering::SeqCst);
        let dispatcher = FailoverDispatcher::builder(Unlimited)
            .backend(backend)
            .backend(Arc::new(LogBackend::default()))
            .failure_threshold(1)
            .build()
            .unwrap();
        let _ = dispatcher.send(&notification()).await;

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("ERROR"), "demotion should log at error: {logs}");
        assert!(logs.contains("courier::failover"));
        assert!(logs.contains("backend demoted"));
    }

    struct Exhausted;

    #[async_trait]
    impl RateLimiter for Exhausted {
        async fn limit(&self, _key: &str) -> Result<Decision, LimiterError> {
            Ok(Decision::Denied { wait: Duration::from_millis(250) })
        }
    }

    #[tokio::test]
    async fn nested_rate_limit_does_not_demote() {
        let inner = FailoverDispatcher::builder(Exhausted)
            .backend(Arc::new(LogBackend::new("inner")))
            .build()
            .unwrap();
        let outer = FailoverDispatcher::builder(Unlimited)
            .backend(Arc::new(inner))
            .backend(Arc::new(LogBackend::new("standby")))
            .failure_threshold(1)
            .build()
            .unwrap();

        let err = outer.send(&notification()).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
        assert_eq!(outer.snapshot(), FailoverSnapshot { active: 0, consecutive_failures: 0 });
    }

    #[tokio::test]
    async fn dispatcher_nests_as_a_backend() {
        let inner = FailoverDispatcher::builder(Unlimited)
            .backend(Arc::new(LogBackend::new("inner")))
            .build()
            .unwrap();
        let outer = FailoverDispatcher::builder(Unlimited)
            .backend(Arc::new(inner))
            .build()
            .unwrap();
        assert_eq!(outer.backends()[0].name(), "failover");
        outer.send(&notification()).await.unwrap();
    }
}
