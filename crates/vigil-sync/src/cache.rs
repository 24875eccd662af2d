//! Windowed metric caching and fan-out.
//!
//! [`MetricCache`] keeps, per key, every sample inside a sliding time
//! window. The window fills from history on first request (concurrent
//! requests for the same key coalesce into one fetch) and grows from live
//! feed samples afterwards. Each live ingest delivers the entire updated
//! window to every subscriber of that key, so consumers never diff deltas.
//!
//! Retention is bounded by time, not count: samples older than the window
//! are evicted on live ingest. The history fill itself is not re-filtered;
//! whatever the backend returned stays until the next live sample ages it
//! out.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use vigil_core::Timestamped;

use crate::history::{HistoryFetcher, TimeRange};

/// One delivered window: every sample for a key, oldest history first.
pub type Window<S> = Arc<[S]>;

type FetchFuture<S> = Shared<BoxFuture<'static, Option<Window<S>>>>;

struct SubscriberSlot<S> {
    id: u64,
    tx: mpsc::Sender<Window<S>>,
}

struct CacheInner<K, S> {
    windows: HashMap<K, Vec<S>>,
    subscribers: HashMap<K, Vec<SubscriberSlot<S>>>,
    in_flight: HashMap<K, FetchFuture<S>>,
    /// Bumped by `clear`; a fetch writing back compares first, so a fill
    /// started before a clear cannot resurrect stale data.
    generation: u64,
    next_subscriber_id: u64,
    dropped_deliveries: u64,
}

/// Sliding-window sample cache with per-key subscribers.
pub struct MetricCache<K: Eq + Hash, S> {
    label: &'static str,
    window: Duration,
    subscriber_capacity: usize,
    fetcher: Arc<dyn HistoryFetcher<K, S>>,
    inner: Arc<Mutex<CacheInner<K, S>>>,
}

impl<K, S> MetricCache<K, S>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    S: Timestamped + Clone + Send + Sync + 'static,
{
    /// Create a cache holding `window_ms` of samples per key.
    ///
    /// `label` names the cache in logs. `subscriber_capacity` bounds each
    /// subscriber's delivery channel; a subscriber that falls behind loses
    /// deliveries, never cached samples.
    pub fn new(
        label: &'static str,
        window_ms: u64,
        subscriber_capacity: usize,
        fetcher: Arc<dyn HistoryFetcher<K, S>>,
    ) -> Self {
        let window = Duration::milliseconds(i64::try_from(window_ms).unwrap_or(i64::MAX));
        Self {
            label,
            window,
            subscriber_capacity: subscriber_capacity.max(1),
            fetcher,
            inner: Arc::new(Mutex::new(CacheInner {
                windows: HashMap::new(),
                subscribers: HashMap::new(),
                in_flight: HashMap::new(),
                generation: 0,
                next_subscriber_id: 0,
                dropped_deliveries: 0,
            })),
        }
    }

    /// Subscribe to window updates for `key`.
    ///
    /// Dropping the subscription unsubscribes; when the last subscriber for
    /// a key goes, its subscriber set is removed (the cached window stays).
    #[must_use]
    pub fn subscribe(&self, key: K) -> MetricSubscription<K, S> {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner
                .subscribers
                .entry(key.clone())
                .or_default()
                .push(SubscriberSlot { id, tx });
            id
        };
        debug!(cache = self.label, key = ?key, subscriber = id, "subscriber added");
        MetricSubscription {
            key,
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// The current window for `key`, filling from history when absent.
    ///
    /// A cached window returns as-is. Otherwise one history fetch runs per
    /// key at a time; concurrent callers share its result. The fetched
    /// samples are sorted ascending, merged with any live samples that
    /// arrived meanwhile, and cached. A failed fetch resolves every waiter
    /// with an empty window and caches nothing, so the next request tries
    /// again.
    pub async fn initial_window(&self, key: &K) -> Window<S> {
        let fetch = {
            let mut inner = self.inner.lock();
            if let Some(samples) = inner.windows.get(key) {
                return Arc::from(samples.as_slice());
            }
            match inner.in_flight.get(key) {
                Some(shared) => shared.clone(),
                None => {
                    let shared = self.fetch_future(key, inner.generation);
                    let _ = inner.in_flight.insert(key.clone(), shared.clone());
                    shared
                }
            }
        };
        fetch.await.unwrap_or_else(|| Arc::from([]))
    }

    /// Ingest one live sample for `key`.
    pub fn on_live_sample(&self, key: K, sample: S) {
        self.ingest(key, std::iter::once(sample));
    }

    /// Ingest a batch of live samples for `key` with a single delivery.
    pub fn on_live_batch(&self, key: K, samples: Vec<S>) {
        if samples.is_empty() {
            return;
        }
        self.ingest(key, samples.into_iter());
    }

    /// Drop every cached window, pending fill, and subscriber.
    ///
    /// Subscribers observe their channel closing. Safe to call repeatedly.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.windows.clear();
        inner.subscribers.clear();
        inner.in_flight.clear();
        debug!(cache = self.label, "cache cleared");
    }

    /// Whether a window is cached for `key`.
    #[must_use]
    pub fn has_window(&self, key: &K) -> bool {
        self.inner.lock().windows.contains_key(key)
    }

    /// Deliveries dropped because a subscriber channel was full.
    #[must_use]
    pub fn dropped_deliveries(&self) -> u64 {
        self.inner.lock().dropped_deliveries
    }

    fn ingest(&self, key: K, samples: impl Iterator<Item = S>) {
        let cutoff = self.cutoff(Utc::now());
        let (window, targets) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let entry = inner.windows.entry(key.clone()).or_default();
            entry.extend(samples);
            entry.retain(|sample| sample.timestamp() >= cutoff);
            let window: Window<S> = Arc::from(entry.as_slice());
            let targets: Vec<(u64, mpsc::Sender<Window<S>>)> = inner
                .subscribers
                .get(&key)
                .map(|slots| slots.iter().map(|slot| (slot.id, slot.tx.clone())).collect())
                .unwrap_or_default();
            (window, targets)
        };

        let mut dropped = 0_u64;
        let mut gone: Vec<u64> = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(Arc::clone(&window)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    debug!(cache = self.label, key = ?key, subscriber = id, "subscriber lagging, delivery dropped");
                }
                Err(TrySendError::Closed(_)) => gone.push(id),
            }
        }
        if dropped > 0 || !gone.is_empty() {
            let mut inner = self.inner.lock();
            inner.dropped_deliveries += dropped;
            if !gone.is_empty() {
                let empty = match inner.subscribers.get_mut(&key) {
                    Some(slots) => {
                        slots.retain(|slot| !gone.contains(&slot.id));
                        slots.is_empty()
                    }
                    None => false,
                };
                if empty {
                    let _ = inner.subscribers.remove(&key);
                }
            }
        }
    }

    fn fetch_future(&self, key: &K, generation: u64) -> FetchFuture<S> {
        let fetcher = Arc::clone(&self.fetcher);
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        let window = self.window;
        let label = self.label;
        async move {
            let until = Utc::now();
            let since = until
                .checked_sub_signed(window)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let result = fetcher.fetch_window(&key, TimeRange { since, until }).await;

            let mut guard = inner.lock();
            if guard.generation != generation {
                debug!(cache = label, key = ?key, "cache cleared during fill, discarding");
                return None;
            }
            let _ = guard.in_flight.remove(&key);
            match result {
                Ok(mut samples) => {
                    samples.sort_by_key(Timestamped::timestamp);
                    let entry = guard.windows.entry(key).or_default();
                    // Live samples that arrived during the fetch stay after
                    // the history, then one stable sort orders the window.
                    let live = std::mem::take(entry);
                    *entry = samples;
                    entry.extend(live);
                    entry.sort_by_key(Timestamped::timestamp);
                    Some(Arc::from(entry.as_slice()))
                }
                Err(e) => {
                    warn!(cache = label, key = ?key, error = %e, "history fill failed");
                    None
                }
            }
        }
        .boxed()
        .shared()
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription handle
// ─────────────────────────────────────────────────────────────────────────────

/// A live subscription to one key's window updates.
///
/// Dropping the handle unsubscribes.
pub struct MetricSubscription<K: Eq + Hash, S> {
    key: K,
    id: u64,
    rx: mpsc::Receiver<Window<S>>,
    inner: Arc<Mutex<CacheInner<K, S>>>,
}

impl<K: Eq + Hash, S> MetricSubscription<K, S> {
    /// The subscribed key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Next delivered window, or `None` once the cache cleared.
    pub async fn next_window(&mut self) -> Option<Window<S>> {
        self.rx.recv().await
    }
}

impl<K: Eq + Hash, S> Drop for MetricSubscription<K, S> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        let empty = match inner.subscribers.get_mut(&self.key) {
            Some(slots) => {
                slots.retain(|slot| slot.id != self.id);
                slots.is_empty()
            }
            None => false,
        };
        if empty {
            let _ = inner.subscribers.remove(&self.key);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use crate::error::HistoryError;
    use vigil_core::{MetricChannel, MetricPoint, ServerId};

    const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
    const WINDOW_MS: u64 = 600_000;

    fn point(server: &str, secs_ago: i64, value: f64) -> MetricPoint {
        MetricPoint {
            server_id: ServerId::from(server),
            channel: MetricChannel::Cpu,
            value,
            recorded_at: Utc::now() - Duration::seconds(secs_ago),
        }
    }

    struct CountingFetcher {
        calls: AtomicUsize,
        samples: Mutex<Vec<MetricPoint>>,
        fail_remaining: AtomicUsize,
        /// When set, each fetch parks here until notified.
        gate: Option<Arc<Notify>>,
    }

    impl CountingFetcher {
        fn with(samples: Vec<MetricPoint>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                samples: Mutex::new(samples),
                fail_remaining: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HistoryFetcher<ServerId, MetricPoint> for CountingFetcher {
        async fn fetch_window(
            &self,
            _key: &ServerId,
            _range: TimeRange,
        ) -> Result<Vec<MetricPoint>, HistoryError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            } else {
                tokio::task::yield_now().await;
            }
            if self.fail_remaining.load(Ordering::SeqCst) > 0 {
                let _ = self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(HistoryError::Status(500));
            }
            Ok(self.samples.lock().clone())
        }
    }

    fn make_cache(fetcher: Arc<CountingFetcher>) -> MetricCache<ServerId, MetricPoint> {
        MetricCache::new("perf", WINDOW_MS, 16, fetcher)
    }

    #[tokio::test]
    async fn initial_window_fetches_and_sorts() {
        let fetcher = CountingFetcher::with(vec![
            point("srv-1", 60, 2.0),
            point("srv-1", 300, 1.0),
        ]);
        let cache = make_cache(Arc::clone(&fetcher));

        let window = cache.initial_window(&ServerId::from("srv-1")).await;

        assert_eq!(window.len(), 2);
        assert_eq!(window[0].value, 1.0);
        assert!(window[0].recorded_at <= window[1].recorded_at);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn cached_window_returned_without_refetch() {
        let fetcher = CountingFetcher::with(vec![point("srv-1", 60, 1.0)]);
        let cache = make_cache(Arc::clone(&fetcher));
        let key = ServerId::from("srv-1");

        let first = cache.initial_window(&key).await;
        let second = cache.initial_window(&key).await;

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce() {
        let fetcher = CountingFetcher::with(vec![point("srv-1", 60, 1.0)]);
        let cache = make_cache(Arc::clone(&fetcher));
        let key = ServerId::from("srv-1");

        let (a, b) = tokio::join!(cache.initial_window(&key), cache.initial_window(&key));

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn failed_fill_is_empty_and_not_cached() {
        let fetcher = CountingFetcher::with(vec![point("srv-1", 60, 1.0)]);
        fetcher.fail_remaining.store(1, Ordering::SeqCst);
        let cache = make_cache(Arc::clone(&fetcher));
        let key = ServerId::from("srv-1");

        let first = cache.initial_window(&key).await;
        assert!(first.is_empty());
        assert!(!cache.has_window(&key));

        // The failure was not cached; the next request fetches again.
        let second = cache.initial_window(&key).await;
        assert_eq!(second.len(), 1);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn live_samples_cached_without_subscribers() {
        let fetcher = CountingFetcher::with(Vec::new());
        let cache = make_cache(Arc::clone(&fetcher));
        let key = ServerId::from("srv-1");

        cache.on_live_sample(key.clone(), point("srv-1", 10, 5.0));
        assert!(cache.has_window(&key));

        // The cached window satisfies the request; no history fetch runs.
        let window = cache.initial_window(&key).await;
        assert_eq!(window.len(), 1);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_gets_the_whole_window() {
        let cache = make_cache(CountingFetcher::with(Vec::new()));
        let key = ServerId::from("srv-1");
        let mut sub_a = cache.subscribe(key.clone());
        let mut sub_b = cache.subscribe(key.clone());

        cache.on_live_sample(key.clone(), point("srv-1", 10, 1.0));
        cache.on_live_sample(key.clone(), point("srv-1", 5, 2.0));

        for sub in [&mut sub_a, &mut sub_b] {
            let first = timeout(TIMEOUT, sub.next_window())
                .await
                .expect("timed out")
                .expect("channel closed");
            assert_eq!(first.len(), 1);
            let second = timeout(TIMEOUT, sub.next_window())
                .await
                .expect("timed out")
                .expect("channel closed");
            assert_eq!(second.len(), 2);
            assert_eq!(second[1].value, 2.0);
        }
    }

    #[tokio::test]
    async fn batch_ingest_delivers_once() {
        let cache = make_cache(CountingFetcher::with(Vec::new()));
        let key = ServerId::from("srv-1");
        let mut sub = cache.subscribe(key.clone());

        cache.on_live_batch(
            key.clone(),
            vec![point("srv-1", 10, 1.0), point("srv-1", 5, 2.0)],
        );
        cache.on_live_batch(key.clone(), Vec::new());
        cache.on_live_sample(key.clone(), point("srv-1", 1, 3.0));

        let first = timeout(TIMEOUT, sub.next_window())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(first.len(), 2);
        // The empty batch delivered nothing; the next window is the ingest.
        let second = timeout(TIMEOUT, sub.next_window())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(second.len(), 3);
    }

    #[tokio::test]
    async fn old_samples_evicted_on_live_ingest() {
        // An 11-minute-old sample enters through the history fill, which
        // does not re-filter.
        let fetcher = CountingFetcher::with(vec![point("srv-1", 660, 1.0)]);
        let cache = make_cache(fetcher);
        let key = ServerId::from("srv-1");

        let seeded = cache.initial_window(&key).await;
        assert_eq!(seeded.len(), 1);

        // The next live sample ages it out of the ten-minute window.
        cache.on_live_sample(key.clone(), point("srv-1", 0, 2.0));
        let window = cache.initial_window(&key).await;
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].value, 2.0);
    }

    #[tokio::test]
    async fn lagging_subscriber_loses_deliveries_not_samples() {
        let cache = MetricCache::new("perf", WINDOW_MS, 1, CountingFetcher::with(Vec::new()));
        let key = ServerId::from("srv-1");
        let mut sub = cache.subscribe(key.clone());

        cache.on_live_sample(key.clone(), point("srv-1", 3, 1.0));
        cache.on_live_sample(key.clone(), point("srv-1", 2, 2.0));
        assert_eq!(cache.dropped_deliveries(), 1);

        let first = timeout(TIMEOUT, sub.next_window())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(first.len(), 1);

        // The cache itself kept everything.
        cache.on_live_sample(key.clone(), point("srv-1", 1, 3.0));
        let next = timeout(TIMEOUT, sub.next_window())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(next.len(), 3);
    }

    #[tokio::test]
    async fn drop_unsubscribes_and_removes_empty_set() {
        let cache = make_cache(CountingFetcher::with(Vec::new()));
        let key = ServerId::from("srv-1");

        let sub_a = cache.subscribe(key.clone());
        let mut sub_b = cache.subscribe(key.clone());
        assert_eq!(cache.inner.lock().subscribers[&key].len(), 2);

        // The survivor keeps receiving after the first handle is dropped.
        drop(sub_a);
        assert_eq!(cache.inner.lock().subscribers[&key].len(), 1);
        cache.on_live_sample(key.clone(), point("srv-1", 5, 1.0));
        let window = timeout(TIMEOUT, sub_b.next_window())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(window.len(), 1);

        drop(sub_b);
        assert!(cache.inner.lock().subscribers.is_empty());
    }

    #[tokio::test]
    async fn clear_closes_subscribers_and_empties() {
        let cache = make_cache(CountingFetcher::with(Vec::new()));
        let key = ServerId::from("srv-1");
        let mut sub = cache.subscribe(key.clone());
        cache.on_live_sample(key.clone(), point("srv-1", 10, 1.0));
        let _ = timeout(TIMEOUT, sub.next_window())
            .await
            .expect("timed out")
            .expect("channel closed");

        cache.clear();

        assert!(
            timeout(TIMEOUT, sub.next_window())
                .await
                .expect("timed out")
                .is_none()
        );
        assert!(!cache.has_window(&key));
        cache.clear();
    }

    #[tokio::test]
    async fn live_sample_during_fill_merges_into_window() {
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            samples: Mutex::new(vec![point("srv-1", 120, 1.0)]),
            fail_remaining: AtomicUsize::new(0),
            gate: Some(Arc::clone(&gate)),
        });
        let cache = make_cache(fetcher);
        let key = ServerId::from("srv-1");

        let mut fill = std::pin::pin!(cache.initial_window(&key));
        assert!(futures::poll!(fill.as_mut()).is_pending());

        cache.on_live_sample(key.clone(), point("srv-1", 0, 9.0));
        gate.notify_one();

        let window = fill.await;
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].value, 1.0);
        assert_eq!(window[1].value, 9.0);
    }

    #[tokio::test]
    async fn clear_during_fill_discards_stale_data() {
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            samples: Mutex::new(vec![point("srv-1", 60, 1.0)]),
            fail_remaining: AtomicUsize::new(0),
            gate: Some(Arc::clone(&gate)),
        });
        let cache = make_cache(fetcher);
        let key = ServerId::from("srv-1");

        let mut fill = std::pin::pin!(cache.initial_window(&key));
        assert!(futures::poll!(fill.as_mut()).is_pending());

        cache.clear();
        gate.notify_one();

        let window = fill.await;
        assert!(window.is_empty());
        assert!(!cache.has_window(&key));
    }
}
