use courier::rate_limit::store::{
    CounterStore, InMemoryCounterStore, InMemoryWindowStore, OptimisticCounterStore,
};
use courier::rate_limit::{Decision, RateLimiter, SlidingWindowConfig, SlidingWindowLimiter};
use courier::clock::ManualClock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

const WINDOW: Duration = Duration::from_secs(1);

fn limiter<S>(store: S, threshold: u32, clock: &ManualClock) -> SlidingWindowLimiter<S>
where
    S: CounterStore,
{
    let config = SlidingWindowConfig::new(WINDOW, threshold).expect("valid config");
    SlidingWindowLimiter::new(store, config).with_clock(clock.clone())
}

async fn fills_then_recovers<S: CounterStore>(store: S) {
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let limiter = limiter(store, 5, &clock);

    for _ in 0..5 {
        assert!(limiter.limit("sms-limiter").await.expect("store up").is_allowed());
        clock.advance(Duration::from_millis(10));
    }
    let denied = limiter.limit("sms-limiter").await.expect("store up");
    assert_eq!(denied, Decision::Denied { wait: Duration::from_millis(950) });

    // The first event is exactly one window old: it has expired.
    clock.set(1_700_000_000_000 + 1_000);
    assert!(limiter.limit("sms-limiter").await.expect("store up").is_allowed());
    assert!(limiter.limit("sms-limiter").await.expect("store up").is_limited());
}

#[tokio::test]
async fn in_memory_window_fills_then_recovers() {
    fills_then_recovers(InMemoryCounterStore::new()).await;
}

#[tokio::test]
async fn optimistic_window_fills_then_recovers() {
    fills_then_recovers(OptimisticCounterStore::new(InMemoryWindowStore::new())).await;
}

#[tokio::test]
async fn keys_are_independent() {
    let clock = ManualClock::starting_at(10_000);
    let limiter = limiter(InMemoryCounterStore::new(), 1, &clock);

    assert!(limiter.limit("ip-limiter:10.0.0.1").await.unwrap().is_allowed());
    assert!(limiter.limit("ip-limiter:10.0.0.2").await.unwrap().is_allowed());
    assert!(limiter.limit("ip-limiter:10.0.0.1").await.unwrap().is_limited());
}

#[tokio::test]
async fn denied_calls_do_not_extend_the_window() {
    let clock = ManualClock::starting_at(0);
    let limiter = limiter(InMemoryCounterStore::new(), 1, &clock);

    assert!(limiter.limit("k").await.unwrap().is_allowed());
    for _ in 0..9 {
        clock.advance(Duration::from_millis(100));
        assert!(limiter.limit("k").await.unwrap().is_limited());
    }
    clock.advance(Duration::from_millis(100));
    assert!(limiter.limit("k").await.unwrap().is_allowed());
}

async fn concurrent_admissions<S>(store: S) -> (usize, usize)
where
    S: CounterStore + 'static,
{
    const THRESHOLD: u32 = 25;
    let clock = ManualClock::starting_at(5_000_000);
    let limiter = Arc::new(limiter(store, THRESHOLD, &clock));
    let callers = 2 * THRESHOLD as usize;
    let barrier = Arc::new(Barrier::new(callers));

    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let limiter = limiter.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                limiter.limit("fresh-key").await
            })
        })
        .collect();

    let mut allowed = 0;
    let mut denied = 0;
    for result in futures::future::join_all(handles).await {
        match result.expect("task panicked").expect("store up") {
            Decision::Allowed { .. } => allowed += 1,
            Decision::Denied { .. } => denied += 1,
        }
    }
    (allowed, denied)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_overshoot_in_memory() {
    let (allowed, denied) = concurrent_admissions(InMemoryCounterStore::new()).await;
    assert_eq!((allowed, denied), (25, 25));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_overshoot_with_compare_and_swap() {
    let store = OptimisticCounterStore::new(InMemoryWindowStore::new())
        .with_max_attempts(10_000)
        .expect("non-zero attempts");
    let (allowed, denied) = concurrent_admissions(store).await;
    assert_eq!((allowed, denied), (25, 25));
}

#[tokio::test]
async fn shared_store_enforces_one_budget_across_limiters() {
    // Two limiters stand in for two processes sharing a store.
    let clock = ManualClock::starting_at(0);
    let store = Arc::new(InMemoryCounterStore::new());
    let a = limiter(store.clone(), 3, &clock);
    let b = limiter(store, 3, &clock);

    assert!(a.limit("sms-limiter").await.unwrap().is_allowed());
    assert!(b.limit("sms-limiter").await.unwrap().is_allowed());
    assert!(a.limit("sms-limiter").await.unwrap().is_allowed());
    assert!(b.limit("sms-limiter").await.unwrap().is_limited());
}

#[tokio::test]
async fn per_client_keys_are_released_once_idle() {
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let store = InMemoryCounterStore::new();
    let limiter = limiter(store.clone(), 5, &clock);

    for client in 0..10_000 {
        let key = format!("ip-limiter:{client}");
        assert!(limiter.limit(&key).await.unwrap().is_allowed());
    }
    assert_eq!(store.tracked_keys(), 10_000);

    clock.advance(Duration::from_secs(3_600));
    assert!(limiter.limit("ip-limiter:late").await.unwrap().is_allowed());
    assert_eq!(store.tracked_keys(), 1);
}
