use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, LimiterError};
use crate::rate_limit::store::CounterStore;
use crate::rate_limit::{Decision, RateLimiter};
use crate::telemetry::{emit_best_effort, CourierEvent, LimiterEvent, NullSink, TelemetrySink};
use crate::tunable::Tunable;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Validated window configuration.
///
/// Deserializing goes through [`SlidingWindowConfig::new`], so a loaded config is as valid as
/// a constructed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawSlidingWindowConfig"))]
pub struct SlidingWindowConfig {
    window: Duration,
    threshold: u32,
}

#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawSlidingWindowConfig {
    window: Duration,
    threshold: u32,
}

#[cfg(feature = "serde")]
impl TryFrom<RawSlidingWindowConfig> for SlidingWindowConfig {
    type Error = ConfigError;

    fn try_from(raw: RawSlidingWindowConfig) -> Result<Self, Self::Error> {
        Self::new(raw.window, raw.threshold)
    }
}

impl SlidingWindowConfig {
    /// At most `threshold` events per `window`. Both must be non-zero.
    pub fn new(window: Duration, threshold: u32) -> Result<Self, ConfigError> {
        validate_window(&window)?;
        validate_threshold(&threshold)?;
        Ok(Self { window, threshold })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

fn validate_window(window: &Duration) -> Result<(), ConfigError> {
    if window.is_zero() {
        return Err(ConfigError::ZeroWindow);
    }
    Ok(())
}

fn validate_threshold(threshold: &u32) -> Result<(), ConfigError> {
    if *threshold == 0 {
        return Err(ConfigError::ZeroThreshold);
    }
    Ok(())
}

/// Sliding-window log limiter: at most `threshold` admitted events per `window`, per key,
/// shared by every process using the same [`CounterStore`].
///
/// # Example
/// ```
/// use courier::rate_limit::store::InMemoryCounterStore;
/// use courier::rate_limit::{RateLimiter, SlidingWindowConfig, SlidingWindowLimiter};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = SlidingWindowConfig::new(Duration::from_secs(1), 1000).unwrap();
/// let limiter = SlidingWindowLimiter::new(InMemoryCounterStore::new(), config);
/// let decision = limiter.limit("sms-limiter").await.unwrap();
/// assert!(decision.is_allowed());
/// # }
/// ```
pub struct SlidingWindowLimiter<S, K = NullSink> {
    store: S,
    window: Tunable<Duration>,
    threshold: Tunable<u32>,
    clock: Arc<dyn Clock>,
    sink: K,
}

impl<S> SlidingWindowLimiter<S, NullSink>
where
    S: CounterStore,
{
    pub fn new(store: S, config: SlidingWindowConfig) -> Self {
        Self {
            store,
            window: Tunable::new(config.window).with_validator(validate_window),
            threshold: Tunable::new(config.threshold).with_validator(validate_threshold),
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }
}

impl<S, K> SlidingWindowLimiter<S, K>
where
    S: CounterStore,
    K: TelemetrySink,
{
    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Attach a telemetry sink.
    pub fn with_sink<K2: TelemetrySink>(self, sink: K2) -> SlidingWindowLimiter<S, K2> {
        SlidingWindowLimiter {
            store: self.store,
            window: self.window,
            threshold: self.threshold,
            clock: self.clock,
            sink,
        }
    }

    /// Live handle to the window duration; updates apply to subsequent calls.
    pub fn window_handle(&self) -> Tunable<Duration> {
        self.window.clone()
    }

    /// Live handle to the threshold; updates apply to subsequent calls.
    pub fn threshold_handle(&self) -> Tunable<u32> {
        self.threshold.clone()
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> SlidingWindowConfig {
        SlidingWindowConfig { window: self.window.get(), threshold: self.threshold.get() }
    }
}

impl<S, K> std::fmt::Debug for SlidingWindowLimiter<S, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("window", &self.window.get())
            .field("threshold", &self.threshold.get())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S, K> RateLimiter for SlidingWindowLimiter<S, K>
where
    S: CounterStore,
    K: TelemetrySink,
{
    async fn limit(&self, key: &str) -> Result<Decision, LimiterError> {
        if key.is_empty() {
            return Err(LimiterError::EmptyKey);
        }

        let window = self.window.get();
        let threshold = self.threshold.get();
        let now = self.clock.now_millis();

        let admission = match self.store.evaluate(key, window, threshold, now).await {
            Ok(admission) => admission,
            Err(source) => {
                tracing::warn!(
                    target: "courier::rate_limit",
                    key,
                    error = %source,
                    "counter store unavailable; no admission decision"
                );
                emit_best_effort(
                    self.sink.clone(),
                    CourierEvent::Limiter(LimiterEvent::StoreUnavailable { key: key.to_string() }),
                )
                .await;
                return Err(LimiterError::StoreUnavailable { key: key.to_string(), source });
            }
        };

        let decision = if admission.admitted {
            Decision::Allowed { remaining: threshold.saturating_sub(admission.in_window) }
        } else {
            Decision::Denied { wait: admission.retry_after.unwrap_or(window) }
        };

        let event = match decision {
            Decision::Allowed { remaining } => {
                LimiterEvent::Admitted { key: key.to_string(), remaining }
            }
            Decision::Denied { wait } => {
                tracing::debug!(
                    target: "courier::rate_limit",
                    key,
                    in_window = admission.in_window,
                    threshold,
                    ?wait,
                    "rate limited"
                );
                LimiterEvent::Denied { key: key.to_string(), wait }
            }
        };
        emit_best_effort(self.sink.clone(), CourierEvent::Limiter(event)).await;

        Ok(decision)
    }
}
