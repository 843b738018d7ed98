use async_trait::async_trait;
use courier::error::{BoxError, DispatchError, LimiterError, StoreError};
use courier::failover::{Backend, FailoverDispatcher, FailoverSnapshot, Notification};
use courier::rate_limit::store::InMemoryCounterStore;
use courier::rate_limit::{
    Decision, RateLimiter, SlidingWindowConfig, SlidingWindowLimiter, StoreFailurePolicy,
};
use courier::telemetry::{CourierEvent, FailoverEvent, MemorySink};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn limit(&self, _key: &str) -> Result<Decision, LimiterError> {
        Ok(Decision::Allowed { remaining: u32::MAX })
    }
}

struct StoreDown;

#[async_trait]
impl RateLimiter for StoreDown {
    async fn limit(&self, key: &str) -> Result<Decision, LimiterError> {
        Err(LimiterError::StoreUnavailable {
            key: key.to_string(),
            source: StoreError::unavailable("connection refused"),
        })
    }
}

#[derive(Default)]
struct Provider {
    name: String,
    failing: AtomicBool,
    hang: AtomicBool,
    calls: AtomicUsize,
}

impl Provider {
    fn named(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), ..Default::default() })
    }

    fn failing(name: &str) -> Arc<Self> {
        let provider = Self::named(name);
        provider.failing.store(true, Ordering::SeqCst);
        provider
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for Provider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _notification: &Notification) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err("provider returned 503".into());
        }
        Ok(())
    }
}

fn sms() -> Notification {
    Notification::new("verify", ["4821"], ["+15550100", "+15550101"])
}

#[tokio::test]
async fn rotation_walks_the_ring_and_wraps() {
    let providers = [Provider::failing("a"), Provider::failing("b"), Provider::failing("c")];
    let dispatcher = FailoverDispatcher::builder(Unlimited)
        .backends(providers.iter().map(|p| p.clone() as Arc<dyn Backend>))
        .failure_threshold(2)
        .build()
        .unwrap();

    for expected_after in [1, 2, 0] {
        for _ in 0..2 {
            let err = dispatcher.send(&sms()).await.unwrap_err();
            assert!(matches!(err, DispatchError::Backend { .. }));
        }
        assert_eq!(
            dispatcher.snapshot(),
            FailoverSnapshot { active: expected_after, consecutive_failures: 0 }
        );
    }
    assert_eq!(providers.iter().map(|p| p.calls()).collect::<Vec<_>>(), vec![2, 2, 2]);
}

#[tokio::test]
async fn failed_attempt_is_not_retried_on_the_next_backend() {
    let primary = Provider::failing("primary");
    let secondary = Provider::named("secondary");
    let dispatcher = FailoverDispatcher::builder(Unlimited)
        .backend(primary.clone())
        .backend(secondary.clone())
        .failure_threshold(1)
        .build()
        .unwrap();

    let err = dispatcher.send(&sms()).await.unwrap_err();
    assert_eq!(err.backend(), Some("primary"));
    assert_eq!(secondary.calls(), 0);

    dispatcher.send(&sms()).await.unwrap();
    assert_eq!(secondary.calls(), 1);
}

#[tokio::test]
async fn single_backend_rotates_onto_itself() {
    let only = Provider::failing("only");
    let dispatcher = FailoverDispatcher::builder(Unlimited)
        .backend(only.clone())
        .failure_threshold(2)
        .build()
        .unwrap();

    let _ = dispatcher.send(&sms()).await;
    assert_eq!(dispatcher.snapshot().consecutive_failures, 1);
    let _ = dispatcher.send(&sms()).await;
    assert_eq!(dispatcher.snapshot(), FailoverSnapshot { active: 0, consecutive_failures: 0 });
    assert_eq!(only.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn hung_backend_times_out_and_counts_as_failure() {
    let slow = Provider::named("slow");
    slow.hang.store(true, Ordering::SeqCst);
    let fast = Provider::named("fast");
    let sink = MemorySink::new();
    let dispatcher = FailoverDispatcher::builder(Unlimited)
        .backend(slow.clone())
        .backend(fast.clone())
        .failure_threshold(1)
        .attempt_timeout(Duration::from_millis(250))
        .build()
        .unwrap()
        .with_sink(sink.clone());

    let err = dispatcher.send(&sms()).await.unwrap_err();
    match err {
        DispatchError::BackendTimeout { backend, timeout, elapsed } => {
            assert_eq!(backend, "slow");
            assert_eq!(timeout, Duration::from_millis(250));
            assert!(elapsed >= timeout);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(dispatcher.snapshot().active, 1);
    assert!(sink.events().contains(&CourierEvent::Failover(FailoverEvent::AttemptFailed {
        backend: 0,
        consecutive_failures: 1,
        timed_out: true,
    })));

    dispatcher.send(&sms()).await.unwrap();
    assert_eq!(fast.calls(), 1);
}

#[tokio::test]
async fn denied_admission_attempts_no_backend() {
    let limiter = SlidingWindowLimiter::new(
        InMemoryCounterStore::new(),
        SlidingWindowConfig::new(Duration::from_secs(60), 1).unwrap(),
    );
    let provider = Provider::named("a");
    let dispatcher = FailoverDispatcher::builder(limiter)
        .backend(provider.clone())
        .build()
        .unwrap();

    dispatcher.send(&sms()).await.unwrap();
    let err = dispatcher.send(&sms()).await.unwrap_err();
    assert!(err.is_rate_limited());
    assert!(err.retry_after().is_some());
    assert_eq!(provider.calls(), 1);
    assert_eq!(dispatcher.snapshot().consecutive_failures, 0);
}

#[tokio::test]
async fn limiter_failure_fails_closed_by_default() {
    let provider = Provider::named("a");
    let dispatcher = FailoverDispatcher::builder(StoreDown)
        .backend(provider.clone())
        .build()
        .unwrap();

    let err = dispatcher.send(&sms()).await.unwrap_err();
    assert!(err.is_limiter_unavailable());
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn limiter_failure_can_fail_open() {
    let provider = Provider::named("a");
    let sink = MemorySink::new();
    let dispatcher = FailoverDispatcher::builder(StoreDown)
        .backend(provider.clone())
        .on_limiter_error(StoreFailurePolicy::FailOpen)
        .build()
        .unwrap()
        .with_sink(sink.clone());

    dispatcher.send(&sms()).await.unwrap();
    assert_eq!(provider.calls(), 1);
    assert_eq!(sink.events()[0], CourierEvent::Failover(FailoverEvent::LimiterBypassed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_rotate_once_per_streak() {
    let providers = [Provider::failing("a"), Provider::failing("b"), Provider::failing("c")];
    let dispatcher = Arc::new(
        FailoverDispatcher::builder(Unlimited)
            .backends(providers.iter().map(|p| p.clone() as Arc<dyn Backend>))
            .failure_threshold(3)
            .build()
            .unwrap(),
    );

    let sends = (0..3).map(|_| {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.send(&sms()).await })
    });
    for result in futures::future::join_all(sends).await {
        assert!(result.unwrap().is_err());
    }

    // Exactly one streak of three was recorded, whichever order the failures landed in.
    assert_eq!(dispatcher.snapshot(), FailoverSnapshot { active: 1, consecutive_failures: 0 });
}
