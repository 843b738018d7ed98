//! Counter stores backing the sliding-window limiter.

use crate::error::{ConfigError, StoreError};
use async_trait::async_trait;
use rand::{rng, Rng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Outcome of evaluating one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the event was admitted (and recorded).
    pub admitted: bool,
    /// Events in the window after evaluation, including this one if admitted.
    pub in_window: u32,
    /// For denials: time until the oldest event in the window expires.
    pub retry_after: Option<Duration>,
}

/// Ordered log of admitted event timestamps (Unix milliseconds) for one key.
///
/// An event at `t` is inside the window at `now` iff `t > now - window`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct WindowLog {
    timestamps: VecDeque<u64>,
}

impl WindowLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log from raw timestamps (any order).
    pub fn from_timestamps(timestamps: impl IntoIterator<Item = u64>) -> Self {
        let mut sorted: Vec<u64> = timestamps.into_iter().collect();
        sorted.sort_unstable();
        Self { timestamps: sorted.into() }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> impl Iterator<Item = u64> + '_ {
        self.timestamps.iter().copied()
    }

    /// Newest recorded timestamp, if any.
    pub fn newest(&self) -> Option<u64> {
        self.timestamps.back().copied()
    }

    /// Drop every timestamp that has left the window at `now_millis`.
    pub fn prune(&mut self, window: Duration, now_millis: u64) {
        let window_ms = duration_millis(window);
        self.timestamps.retain(|ts| ts.saturating_add(window_ms) > now_millis);
    }

    /// Prune, count, and record `now_millis` if the count is below `threshold`.
    ///
    /// This is the whole sliding-window decision; stores make it atomic.
    pub fn evaluate(&mut self, window: Duration, threshold: u32, now_millis: u64) -> Admission {
        self.prune(window, now_millis);
        let count = u32::try_from(self.timestamps.len()).unwrap_or(u32::MAX);

        if count < threshold {
            // Peers with skewed clocks may have recorded later timestamps; keep the log sorted.
            let at = self.timestamps.partition_point(|ts| *ts <= now_millis);
            self.timestamps.insert(at, now_millis);
            return Admission { admitted: true, in_window: count + 1, retry_after: None };
        }

        let retry_after = self.timestamps.front().map(|oldest| {
            let expires_at = oldest.saturating_add(duration_millis(window));
            Duration::from_millis(expires_at.saturating_sub(now_millis))
        });
        Admission { admitted: false, in_window: count, retry_after }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Atomic sliding-window evaluation against shared state.
///
/// Two concurrent callers must never both be admitted into the last free slot: the
/// prune/count/record sequence for one key has to be indivisible.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Evaluate the window for `key` at `now_millis`, recording the event if admitted.
    async fn evaluate(
        &self,
        key: &str,
        window: Duration,
        threshold: u32,
        now_millis: u64,
    ) -> Result<Admission, StoreError>;
}

#[async_trait]
impl<S> CounterStore for Arc<S>
where
    S: CounterStore + ?Sized,
{
    async fn evaluate(
        &self,
        key: &str,
        window: Duration,
        threshold: u32,
        now_millis: u64,
    ) -> Result<Admission, StoreError> {
        (**self).evaluate(key, window, threshold, now_millis).await
    }
}

/// Single-process store; evaluation is atomic under one lock.
///
/// Keys whose events have all expired are released at most once per window, during
/// evaluation, so the map tracks only recently active keys.
#[derive(Default, Clone, Debug)]
pub struct InMemoryCounterStore {
    windows: Arc<Mutex<Windows>>,
}

#[derive(Default, Debug)]
struct Windows {
    logs: HashMap<String, WindowLog>,
    // Longest window any caller has evaluated with; keys are only released after it.
    widest: Duration,
    last_sweep: u64,
}

impl Windows {
    fn sweep(&mut self, window: Duration, now_millis: u64) -> usize {
        let window_ms = duration_millis(window);
        let before = self.logs.len();
        self.logs.retain(|_, log| {
            log.newest().is_some_and(|newest| newest.saturating_add(window_ms) > now_millis)
        });
        self.last_sweep = now_millis;
        before - self.logs.len()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove keys whose newest event has left `window`. Returns how many were removed.
    pub fn sweep(&self, window: Duration, now_millis: u64) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).sweep(window, now_millis)
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).logs.len()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn evaluate(
        &self,
        key: &str,
        window: Duration,
        threshold: u32,
        now_millis: u64,
    ) -> Result<Admission, StoreError> {
        let mut guard = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        guard.widest = guard.widest.max(window);
        let widest = guard.widest;
        if now_millis.saturating_sub(guard.last_sweep) >= duration_millis(widest) {
            let released = guard.sweep(widest, now_millis);
            if released > 0 {
                tracing::trace!(target: "courier::rate_limit", released, "released idle keys");
            }
        }
        let log = guard.logs.entry(key.to_string()).or_default();
        Ok(log.evaluate(window, threshold, now_millis))
    }
}

/// A value together with the store revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Versioned key/value storage for window logs, for stores without server-side scripting.
///
/// Wrap an implementation in [`OptimisticCounterStore`] to get an atomic [`CounterStore`].
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Fetch the log for `key` and its current version. `None` if the key was never written.
    async fn load(&self, key: &str) -> Result<Option<Versioned<WindowLog>>, StoreError>;

    /// Write `log` only if the stored version still equals `expected`
    /// (`None` = the key must not exist yet).
    ///
    /// The log is worthless once `ttl` has passed after its newest timestamp; stores should
    /// expire the key by then so idle buckets do not accumulate.
    ///
    /// Returns `Ok(true)` if the write happened, `Ok(false)` if another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        log: &WindowLog,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

/// Default compare-and-swap retry budget per evaluation.
pub const DEFAULT_CAS_ATTEMPTS: usize = 16;

/// Makes any [`WindowStore`] an atomic [`CounterStore`] with an optimistic retry loop.
///
/// Each attempt reads the versioned log, decides locally, and commits the admitted event with
/// compare-and-swap. A lost race re-reads and decides again, so a slot is never handed out
/// twice. Denials write nothing.
#[derive(Debug, Clone)]
pub struct OptimisticCounterStore<S> {
    store: S,
    max_attempts: usize,
}

impl<S> OptimisticCounterStore<S>
where
    S: WindowStore,
{
    pub fn new(store: S) -> Self {
        Self { store, max_attempts: DEFAULT_CAS_ATTEMPTS }
    }

    /// Override the retry budget; must be > 0.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        self.max_attempts = max_attempts;
        Ok(self)
    }

    /// Borrow the wrapped store.
    pub fn inner(&self) -> &S {
        &self.store
    }
}

/// Randomized pause between compare-and-swap attempts so racing writers spread out.
fn contention_pause(attempt: usize) -> Duration {
    let cap = 100u64.saturating_mul(attempt as u64 + 1);
    Duration::from_micros(rng().random_range(0..=cap))
}

#[async_trait]
impl<S> CounterStore for OptimisticCounterStore<S>
where
    S: WindowStore,
{
    async fn evaluate(
        &self,
        key: &str,
        window: Duration,
        threshold: u32,
        now_millis: u64,
    ) -> Result<Admission, StoreError> {
        for attempt in 0..self.max_attempts {
            let (mut log, version) = match self.store.load(key).await? {
                Some(Versioned { value, version }) => (value, Some(version)),
                None => (WindowLog::new(), None),
            };

            let admission = log.evaluate(window, threshold, now_millis);
            if !admission.admitted {
                return Ok(admission);
            }

            if self.store.compare_and_swap(key, version, &log, window).await? {
                return Ok(admission);
            }

            tracing::trace!(
                target: "courier::rate_limit",
                key,
                attempt = attempt + 1,
                "window compare-and-swap lost a race; retrying"
            );
            tokio::time::sleep(contention_pause(attempt)).await;
        }

        Err(StoreError::Contention { attempts: self.max_attempts })
    }
}

/// In-memory [`WindowStore`] with etcd-like global revisions. Useful for exercising the
/// optimistic path in tests.
///
/// Entries expire `ttl` after their newest timestamp; expired entries are dropped on writes,
/// at most once per `ttl`.
#[derive(Default, Clone, Debug)]
pub struct InMemoryWindowStore {
    inner: Arc<Mutex<RevisionedMap>>,
}

#[derive(Default, Debug)]
struct RevisionedMap {
    revision: u64,
    entries: HashMap<String, Entry>,
    last_sweep: u64,
}

#[derive(Debug)]
struct Entry {
    log: Versioned<WindowLog>,
    expires_at: u64,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn tracked_keys(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned<WindowLog>>, StoreError> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.entries.get(key).map(|entry| entry.log.clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        log: &WindowLog,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let current = guard.entries.get(key).map(|entry| entry.log.version);
        if current != expected {
            return Ok(false);
        }

        let ttl_ms = duration_millis(ttl);
        let now = log.newest().unwrap_or(0);
        if now.saturating_sub(guard.last_sweep) >= ttl_ms {
            // Never expire the entry being written; its version was just checked.
            guard.entries.retain(|k, entry| k == key || entry.expires_at > now);
            guard.last_sweep = now;
        }

        guard.revision += 1;
        let version = guard.revision;
        let entry = Entry {
            log: Versioned { value: log.clone(), version },
            expires_at: now.saturating_add(ttl_ms),
        };
        guard.entries.insert(key.to_string(), entry);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const W: Duration = Duration::from_secs(1);

    #[test]
    fn evaluate_admits_until_threshold() {
        let mut log = WindowLog::new();
        for i in 0..3 {
            let adm = log.evaluate(W, 3, 1_000 + i);
            assert!(adm.admitted);
            assert_eq!(adm.in_window, i as u32 + 1);
        }
        let denied = log.evaluate(W, 3, 1_500);
        assert!(!denied.admitted);
        assert_eq!(denied.in_window, 3);
        // oldest at 1_000 expires at 2_000
        assert_eq!(denied.retry_after, Some(Duration::from_millis(500)));
        assert_eq!(log.len(), 3, "denials are not recorded");
    }

    #[test]
    fn event_exactly_one_window_old_has_expired() {
        let mut log = WindowLog::from_timestamps([1_000]);
        assert!(log.evaluate(W, 1, 1_999).retry_after.is_some());
        assert!(log.evaluate(W, 1, 2_000).admitted);
    }

    #[test]
    fn skewed_timestamps_stay_sorted() {
        let mut log = WindowLog::from_timestamps([1_500, 1_200]);
        assert!(log.evaluate(W, 5, 1_300).admitted);
        assert_eq!(log.timestamps().collect::<Vec<_>>(), vec![1_200, 1_300, 1_500]);
    }

    #[tokio::test]
    async fn in_memory_keys_are_independent() {
        let store = InMemoryCounterStore::new();
        assert!(store.evaluate("a", W, 1, 10).await.unwrap().admitted);
        assert!(!store.evaluate("a", W, 1, 11).await.unwrap().admitted);
        assert!(store.evaluate("b", W, 1, 12).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn sweep_drops_expired_keys() {
        let store = InMemoryCounterStore::new();
        store.evaluate("old", W, 5, 0).await.unwrap();
        store.evaluate("fresh", W, 5, 900).await.unwrap();
        assert_eq!(store.sweep(W, 1_600), 1);
        assert_eq!(store.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn idle_keys_are_released_during_evaluation() {
        let store = InMemoryCounterStore::new();
        for client in 0..1_000 {
            store.evaluate(&format!("ip-limiter:{client}"), W, 5, 10_000).await.unwrap();
        }
        assert_eq!(store.tracked_keys(), 1_000);

        store.evaluate("ip-limiter:late", W, 5, 10_000 + 3_600_000).await.unwrap();
        assert_eq!(store.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn release_waits_for_the_widest_window() {
        let minute = Duration::from_secs(60);
        let store = InMemoryCounterStore::new();
        store.evaluate("daily", minute, 1, 10_000).await.unwrap();
        // This sweep runs while "daily" is still inside its minute-long window.
        store.evaluate("burst", W, 5, 61_000).await.unwrap();
        assert_eq!(store.tracked_keys(), 2);
        assert!(!store.evaluate("daily", minute, 1, 62_000).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn expired_window_entries_are_dropped_on_write() {
        let store = OptimisticCounterStore::new(InMemoryWindowStore::new());
        for client in 0..100 {
            store.evaluate(&format!("ip-limiter:{client}"), W, 5, 10_000).await.unwrap();
        }
        assert_eq!(store.inner().tracked_keys(), 100);

        store.evaluate("ip-limiter:late", W, 5, 20_000).await.unwrap();
        assert_eq!(store.inner().tracked_keys(), 1);
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = InMemoryWindowStore::new();
        let log = WindowLog::from_timestamps([1]);
        assert!(store.compare_and_swap("k", None, &log, W).await.unwrap());
        assert!(!store.compare_and_swap("k", None, &log, W).await.unwrap());
        let current = store.load("k").await.unwrap().expect("written");
        assert!(store.compare_and_swap("k", Some(current.version), &log, W).await.unwrap());
        assert!(!store.compare_and_swap("k", Some(current.version), &log, W).await.unwrap());
    }

    /// Loses the first `races` commits as if another process wrote in between.
    #[derive(Debug, Default)]
    struct RacyStore {
        inner: InMemoryWindowStore,
        races: usize,
        cas_calls: AtomicUsize,
    }

    #[async_trait]
    impl WindowStore for RacyStore {
        async fn load(&self, key: &str) -> Result<Option<Versioned<WindowLog>>, StoreError> {
            self.inner.load(key).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<u64>,
            log: &WindowLog,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            let call = self.cas_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.races {
                return Ok(false);
            }
            self.inner.compare_and_swap(key, expected, log, ttl).await
        }
    }

    #[tokio::test]
    async fn optimistic_store_retries_lost_races() {
        let racy = RacyStore { races: 2, ..Default::default() };
        let store = OptimisticCounterStore::new(racy);
        let adm = store.evaluate("k", W, 1, 100).await.unwrap();
        assert!(adm.admitted);
        assert_eq!(store.inner().cas_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn optimistic_store_gives_up_after_budget() {
        let racy = RacyStore { races: usize::MAX, ..Default::default() };
        let store = OptimisticCounterStore::new(racy).with_max_attempts(3).unwrap();
        let err = store.evaluate("k", W, 1, 100).await.unwrap_err();
        assert!(matches!(err, StoreError::Contention { attempts: 3 }));
    }

    #[test]
    fn zero_attempt_budget_is_rejected() {
        let err = OptimisticCounterStore::new(InMemoryWindowStore::new())
            .with_max_attempts(0)
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroAttempts);
    }
}
