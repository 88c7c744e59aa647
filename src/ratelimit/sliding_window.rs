//! Sliding-window admission over a shared sorted-set store.
//!
//! Every admitted operation for a key is one record in the key's sorted set,
//! scored by its timestamp in epoch milliseconds. An evaluation prunes records
//! that fell out of the window, records the current operation and counts what
//! remains, so the window start moves continuously with the clock.
//!
//! The read-only pre-check and the batched write are two separate round trips.
//! Concurrent evaluations for the same key can interleave between them, so
//! more than `limit` operations may be admitted under heavy same-key
//! concurrency. Use [`super::ScriptedSlidingWindow`] when hard enforcement is
//! required.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::request::{AdmissionRequest, AdmissionResult};
use super::strategy::Strategy;
use crate::error::{Result, ZlimitError};
use crate::store::{Batch, BatchReplies, ScoreBound, ScoredSetStore, StoreError};

/// Default bound on each round trip to the store.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

/// Approximate sliding-window rate limiter.
pub struct SlidingWindowCounter {
    store: Arc<dyn ScoredSetStore>,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
}

impl SlidingWindowCounter {
    /// Create a counter using the system clock.
    pub fn new(store: Arc<dyn ScoredSetStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound every store round trip by `timeout`.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    async fn bounded<T, F>(&self, operation: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        tokio::time::timeout(self.operation_timeout, operation)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.operation_timeout)))
    }
}

/// Take the next reply of the batch, failing on a missing reply or a
/// per-command error.
fn next_reply(
    replies: &mut impl Iterator<Item = std::result::Result<u64, StoreError>>,
    key: &str,
    operation: &'static str,
) -> Result<u64> {
    let reply = replies.next().unwrap_or_else(|| {
        Err(StoreError::Command("missing pipeline reply".to_string()))
    });

    reply.map_err(|source| ZlimitError::StoreOperationFailed {
        key: key.to_string(),
        operation,
        source,
    })
}

fn total_from_replies(replies: BatchReplies, key: &str) -> Result<u64> {
    let mut replies = replies.into_iter();
    next_reply(&mut replies, key, "remove stale records")?;
    next_reply(&mut replies, key, "add record")?;
    next_reply(&mut replies, key, "count records")
}

#[async_trait]
impl Strategy for SlidingWindowCounter {
    async fn evaluate(&self, request: &AdmissionRequest) -> Result<AdmissionResult> {
        let key = request.key();
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let window_start = now_ms - request.window_ms();
        let expires_at = now
            .checked_add_signed(TimeDelta::milliseconds(request.window_ms()))
            .ok_or_else(|| {
                ZlimitError::InvalidRequest(format!(
                    "window of {}ms overflows the clock",
                    request.window_ms()
                ))
            })?;

        trace!(key = %key, limit = request.limit(), window_start, "Evaluating sliding window");

        // A caller already over quota is denied without writing, so a client
        // that keeps retrying cannot grow its set without bound.
        let probe = self
            .bounded(
                self.store
                    .count_by_score(key, ScoreBound::Exclusive(window_start), ScoreBound::PosInf),
            )
            .await;

        match probe {
            Ok(count) if count >= request.limit() => {
                debug!(key = %key, count, limit = request.limit(), "Rejected by pre-check");
                return Ok(AdmissionResult::deny(count, expires_at));
            }
            Ok(_) => {}
            Err(err) => {
                warn!(key = %key, error = %err, "Pre-check failed, continuing with write");
            }
        }

        let batch = Batch::new()
            .remove_range_by_score(ScoreBound::Inclusive(0), ScoreBound::Inclusive(window_start))
            .add(now_ms, Uuid::new_v4().to_string())
            .count(ScoreBound::NegInf, ScoreBound::PosInf);

        let replies = self
            .bounded(self.store.execute(key, batch))
            .await
            .map_err(|err| ZlimitError::from_store(key, "execute sorted set pipeline", err))?;

        let total = total_from_replies(replies, key)?;

        if total > request.limit() {
            debug!(key = %key, total, limit = request.limit(), "Rate limit exceeded");
            return Ok(AdmissionResult::deny(total, expires_at));
        }

        Ok(AdmissionResult::allow(total, expires_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::request::AdmissionState;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const START_MS: i64 = 1_700_000_000_000;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(START_MS).unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, SlidingWindowCounter) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let counter = SlidingWindowCounter::new(store.clone()).with_clock(clock.clone());
        (store, clock, counter)
    }

    fn request(key: &str, limit: u64, window_ms: u64) -> AdmissionRequest {
        AdmissionRequest::new(key, limit, Duration::from_millis(window_ms)).unwrap()
    }

    /// How a [`FaultyStore`] misbehaves.
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Fault {
        ProbeFails,
        BatchFails,
        BatchUnreachable,
        InsertFails,
        Hangs,
    }

    /// Wraps a [`MemoryStore`] and injects one kind of failure.
    struct FaultyStore {
        inner: MemoryStore,
        fault: Fault,
        executed: AtomicUsize,
    }

    impl FaultyStore {
        fn new(fault: Fault) -> Self {
            Self {
                inner: MemoryStore::new(),
                fault,
                executed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ScoredSetStore for FaultyStore {
        async fn count_by_score(
            &self,
            key: &str,
            min: ScoreBound,
            max: ScoreBound,
        ) -> std::result::Result<u64, StoreError> {
            match self.fault {
                Fault::ProbeFails => Err(StoreError::Command("probe failed".to_string())),
                Fault::Hangs => std::future::pending().await,
                _ => self.inner.count_by_score(key, min, max).await,
            }
        }

        async fn execute(
            &self,
            key: &str,
            batch: Batch,
        ) -> std::result::Result<BatchReplies, StoreError> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            match self.fault {
                Fault::BatchFails => Err(StoreError::Command("EXECABORT".to_string())),
                Fault::BatchUnreachable => {
                    Err(StoreError::Unavailable("connection refused".to_string()))
                }
                Fault::InsertFails => {
                    let mut replies = self.inner.execute(key, batch).await?;
                    replies[1] = Err(StoreError::Command("OOM".to_string()));
                    Ok(replies)
                }
                Fault::Hangs => std::future::pending().await,
                Fault::ProbeFails => self.inner.execute(key, batch).await,
            }
        }
    }

    #[tokio::test]
    async fn test_sequential_quota() {
        let (store, _clock, counter) = setup();
        let req = request("client", 3, 60_000);

        for i in 1..=3 {
            let result = counter.evaluate(&req).await.unwrap();
            assert_eq!(result.state, AdmissionState::Allow, "request {} should be allowed", i);
            assert_eq!(result.total_requests, i);
        }

        // The pre-check rejects the 4th without recording it.
        let result = counter.evaluate(&req).await.unwrap();
        assert_eq!(result.state, AdmissionState::Deny);
        assert_eq!(result.total_requests, 3);
        assert_eq!(store.record_count("client"), 3);
    }

    #[tokio::test]
    async fn test_denied_retries_do_not_grow_the_set() {
        let (store, _clock, counter) = setup();
        let req = request("client", 2, 60_000);

        for _ in 0..10 {
            counter.evaluate(&req).await.unwrap();
        }

        assert_eq!(store.record_count("client"), 2);
    }

    #[tokio::test]
    async fn test_window_roll_off() {
        let (store, clock, counter) = setup();
        let req = request("client", 2, 1_000);

        counter.evaluate(&req).await.unwrap();
        counter.evaluate(&req).await.unwrap();
        assert_eq!(counter.evaluate(&req).await.unwrap().state, AdmissionState::Deny);

        clock.advance(TimeDelta::milliseconds(1_001));

        let result = counter.evaluate(&req).await.unwrap();
        assert_eq!(result.state, AdmissionState::Allow);
        assert_eq!(result.total_requests, 1);
        assert_eq!(store.record_count("client"), 1);
    }

    #[tokio::test]
    async fn test_record_at_window_edge_is_excluded() {
        let (store, clock, counter) = setup();
        let req = request("client", 1, 1_000);

        counter.evaluate(&req).await.unwrap();

        // Exactly one window later the first record sits on the window start.
        clock.advance(TimeDelta::milliseconds(1_000));
        let result = counter.evaluate(&req).await.unwrap();
        assert_eq!(result.state, AdmissionState::Allow);
        assert_eq!(result.total_requests, 1);
        assert_eq!(store.record_count("client"), 1);
    }

    #[tokio::test]
    async fn test_record_just_inside_window_is_counted() {
        let (_store, clock, counter) = setup();
        let req = request("client", 1, 1_000);

        counter.evaluate(&req).await.unwrap();
        clock.advance(TimeDelta::milliseconds(999));

        let result = counter.evaluate(&req).await.unwrap();
        assert_eq!(result.state, AdmissionState::Deny);
        assert_eq!(result.total_requests, 1);
    }

    #[tokio::test]
    async fn test_key_isolation() {
        let (_store, _clock, counter) = setup();

        for _ in 0..5 {
            counter.evaluate(&request("a", 2, 60_000)).await.unwrap();
        }

        let result = counter.evaluate(&request("b", 2, 60_000)).await.unwrap();
        assert_eq!(result.state, AdmissionState::Allow);
        assert_eq!(result.total_requests, 1);
    }

    #[tokio::test]
    async fn test_expiry_hint_tracks_evaluation_time() {
        let (_store, clock, counter) = setup();
        let req = request("client", 10, 60_000);

        let first = counter.evaluate(&req).await.unwrap();
        clock.advance(TimeDelta::milliseconds(1_234));
        let second = counter.evaluate(&req).await.unwrap();

        assert_eq!(first.expires_at.timestamp_millis(), START_MS + 60_000);
        assert_eq!(
            second.expires_at - first.expires_at,
            TimeDelta::milliseconds(1_234)
        );
    }

    #[tokio::test]
    async fn test_identical_timestamps_are_kept_apart() {
        let (store, _clock, counter) = setup();
        let req = request("client", 5, 60_000);

        counter.evaluate(&req).await.unwrap();
        counter.evaluate(&req).await.unwrap();

        assert_eq!(store.record_count("client"), 2);
    }

    #[tokio::test]
    async fn test_limit_change_applies_immediately() {
        let (_store, _clock, counter) = setup();

        for _ in 0..3 {
            counter.evaluate(&request("client", 5, 60_000)).await.unwrap();
        }

        let result = counter.evaluate(&request("client", 3, 60_000)).await.unwrap();
        assert_eq!(result.state, AdmissionState::Deny);

        let result = counter.evaluate(&request("client", 10, 60_000)).await.unwrap();
        assert_eq!(result.state, AdmissionState::Allow);
        assert_eq!(result.total_requests, 4);
    }

    #[tokio::test]
    async fn test_records_from_other_writers_are_counted() {
        let (store, _clock, counter) = setup();

        // Another instance already wrote three records for this key.
        store
            .execute(
                "client",
                Batch::new()
                    .add(START_MS, "x")
                    .add(START_MS, "y")
                    .add(START_MS, "z"),
            )
            .await
            .unwrap();

        let result = counter.evaluate(&request("client", 4, 60_000)).await.unwrap();
        assert_eq!(result.state, AdmissionState::Allow);
        assert_eq!(result.total_requests, 4);
    }

    /// Regression: a failed pre-check must fall through to the write path
    /// instead of deciding anything on its own.
    #[tokio::test]
    async fn test_failed_pre_check_continues_with_write() {
        let store = Arc::new(FaultyStore::new(Fault::ProbeFails));
        let counter = SlidingWindowCounter::new(store.clone())
            .with_clock(Arc::new(ManualClock::new(start())));
        let req = request("client", 1, 60_000);

        let first = counter.evaluate(&req).await.unwrap();
        assert_eq!(first.state, AdmissionState::Allow);

        // Without the probe the over-limit call is recorded, then denied.
        let second = counter.evaluate(&req).await.unwrap();
        assert_eq!(second.state, AdmissionState::Deny);
        assert_eq!(second.total_requests, 2);
        assert_eq!(store.executed.load(Ordering::SeqCst), 2);
    }

    /// Regression: a successful over-limit probe denies without writing.
    #[tokio::test]
    async fn test_successful_over_limit_pre_check_skips_write() {
        let store = Arc::new(FaultyStore::new(Fault::InsertFails));
        store
            .inner
            .execute("client", Batch::new().add(START_MS, "a"))
            .await
            .unwrap();
        let counter = SlidingWindowCounter::new(store.clone())
            .with_clock(Arc::new(ManualClock::new(start())));

        let result = counter.evaluate(&request("client", 1, 60_000)).await.unwrap();
        assert_eq!(result.state, AdmissionState::Deny);
        assert_eq!(result.total_requests, 1);
        assert_eq!(store.executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_batch_failure_is_reported() {
        let counter = SlidingWindowCounter::new(Arc::new(FaultyStore::new(Fault::BatchFails)));

        let err = counter.evaluate(&request("client", 5, 60_000)).await.unwrap_err();
        assert!(matches!(err, ZlimitError::StoreOperationFailed { ref key, .. } if key == "client"));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unavailable() {
        let counter =
            SlidingWindowCounter::new(Arc::new(FaultyStore::new(Fault::BatchUnreachable)));

        let err = counter.evaluate(&request("client", 5, 60_000)).await.unwrap_err();
        assert!(matches!(err, ZlimitError::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_single_command_failure_is_reported() {
        let counter = SlidingWindowCounter::new(Arc::new(FaultyStore::new(Fault::InsertFails)));

        let err = counter.evaluate(&request("client", 5, 60_000)).await.unwrap_err();
        assert!(matches!(
            err,
            ZlimitError::StoreOperationFailed { operation: "add record", .. }
        ));
    }

    #[tokio::test]
    async fn test_hanging_store_times_out() {
        let counter = SlidingWindowCounter::new(Arc::new(FaultyStore::new(Fault::Hangs)))
            .with_operation_timeout(Duration::from_millis(20));

        let err = counter.evaluate(&request("client", 5, 60_000)).await.unwrap_err();
        assert!(matches!(
            err,
            ZlimitError::StoreUnavailable { source: StoreError::Timeout(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_injected_function_clock() {
        let now = Arc::new(Mutex::new(start()));
        let handle = now.clone();
        let store = Arc::new(MemoryStore::new());
        let counter = SlidingWindowCounter::new(store)
            .with_clock(Arc::new(move || *handle.lock()));
        let req = request("client", 1, 500);

        assert!(counter.evaluate(&req).await.unwrap().is_allowed());
        assert!(!counter.evaluate(&req).await.unwrap().is_allowed());

        *now.lock() += TimeDelta::milliseconds(501);
        assert!(counter.evaluate(&req).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_idle_keys_are_reclaimed() {
        let (store, clock, counter) = setup();

        for i in 0..1000 {
            counter
                .evaluate(&request(&format!("k{}", i), 5, 1_000))
                .await
                .unwrap();
        }
        assert_eq!(store.key_count(), 1000);

        clock.advance(TimeDelta::hours(24));
        counter.evaluate(&request("other", 5, 1_000)).await.unwrap();

        assert_eq!(store.key_count(), 1);
        assert_eq!(store.record_count("other"), 1);
    }

    /// Holds every pre-check until all callers have read the count, so each
    /// of them goes on to write.
    struct InterleavingStore {
        inner: MemoryStore,
        probes: tokio::sync::Barrier,
    }

    #[async_trait]
    impl ScoredSetStore for InterleavingStore {
        async fn count_by_score(
            &self,
            key: &str,
            min: ScoreBound,
            max: ScoreBound,
        ) -> std::result::Result<u64, StoreError> {
            let count = self.inner.count_by_score(key, min, max).await;
            self.probes.wait().await;
            count
        }

        async fn execute(
            &self,
            key: &str,
            batch: Batch,
        ) -> std::result::Result<BatchReplies, StoreError> {
            self.inner.execute(key, batch).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_pre_checks_record_denied_calls() {
        const LIMIT: u64 = 3;
        const CALLERS: usize = 8;

        let store = Arc::new(InterleavingStore {
            inner: MemoryStore::new(),
            probes: tokio::sync::Barrier::new(CALLERS),
        });
        let counter = Arc::new(
            SlidingWindowCounter::new(store.clone())
                .with_operation_timeout(Duration::from_secs(5)),
        );
        let req = request("hot", LIMIT, 60_000);

        let handles = (0..CALLERS).map(|_| {
            let counter = counter.clone();
            let req = req.clone();
            tokio::spawn(async move { counter.evaluate(&req).await.unwrap() })
        });
        let results: Vec<AdmissionResult> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        // Every caller passed the pre-check, so every caller was recorded;
        // the post-write count still rejects those past the limit.
        let allowed = results.iter().filter(|r| r.is_allowed()).count();
        assert_eq!(allowed as u64, LIMIT);
        assert_eq!(store.inner.record_count("hot"), CALLERS);

        let mut denied_totals: Vec<u64> = results
            .iter()
            .filter(|r| !r.is_allowed())
            .map(|r| r.total_requests)
            .collect();
        denied_totals.sort_unstable();
        assert_eq!(denied_totals, (LIMIT + 1..=CALLERS as u64).collect::<Vec<_>>());
    }
}
