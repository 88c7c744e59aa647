//! In-process sorted-set store.
//!
//! Mirrors the semantics of Redis' ZCOUNT, ZREMRANGEBYSCORE and ZADD so a
//! single node can run without Redis, and so the admission algorithm can be
//! exercised deterministically. Each batch runs under the key's shard lock
//! and is therefore atomic within the process.
//!
//! There is no server-side expiry to fall back on, so the store sweeps
//! itself: at most once per window, records older than the largest window
//! seen so far are dropped for every key, along with the keys they empty.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{Batch, BatchCommand, BatchReplies, ScoreBound, ScoredSetStore, StoreError};

/// Sorted sets indexed by key, each ordered by `(score, member)`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sets: DashMap<String, BTreeSet<(i64, String)>>,
    /// Largest `added score - pruned upper bound` seen in a batch.
    largest_window_ms: AtomicI64,
    /// Most recent score inserted by any batch.
    latest_score_ms: AtomicI64,
    /// `latest_score_ms` at the time of the last sweep.
    last_sweep_ms: AtomicI64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held for `key`.
    pub fn record_count(&self, key: &str) -> usize {
        self.sets.get(key).map(|set| set.len()).unwrap_or(0)
    }

    /// Number of keys currently holding at least one record.
    pub fn key_count(&self) -> usize {
        self.sets.len()
    }

    /// Remember the window and clock implied by a batch that prunes up to
    /// `window_start` and inserts at `score`.
    fn observe(&self, batch: &Batch) {
        let mut window_start = None;
        let mut added = None;
        for command in batch.commands() {
            match command {
                BatchCommand::RemoveRangeByScore {
                    max: ScoreBound::Inclusive(max),
                    ..
                } => window_start = Some(*max),
                BatchCommand::Add { score, .. } => {
                    added = Some(added.map_or(*score, |a: i64| a.max(*score)))
                }
                _ => {}
            }
        }

        if let Some(score) = added {
            self.latest_score_ms.fetch_max(score, Ordering::Relaxed);
            if let Some(start) = window_start {
                self.largest_window_ms
                    .fetch_max(score.saturating_sub(start), Ordering::Relaxed);
            }
        }
    }

    /// Run a sweep when a full window has passed since the previous one.
    fn maybe_sweep(&self) {
        let window = self.largest_window_ms.load(Ordering::Relaxed);
        if window <= 0 {
            return;
        }

        let latest = self.latest_score_ms.load(Ordering::Relaxed);
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if latest.saturating_sub(last) < window {
            return;
        }
        // one sweeper per window
        if self
            .last_sweep_ms
            .compare_exchange(last, latest, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let removed = self.sweep(latest.saturating_sub(window));
        if removed > 0 {
            debug!(removed, keys = self.sets.len(), "Swept expired records");
        }
    }

    /// Drop every record scored at or before `cutoff`, then every emptied key.
    fn sweep(&self, cutoff: i64) -> usize {
        let mut removed = 0;
        self.sets.retain(|_, set| {
            let before = set.len();
            set.retain(|(score, _)| *score > cutoff);
            removed += before - set.len();
            !set.is_empty()
        });
        removed
    }
}

fn count_in(set: &BTreeSet<(i64, String)>, min: ScoreBound, max: ScoreBound) -> u64 {
    set.iter()
        .filter(|(score, _)| min.admits_from_below(*score) && max.admits_from_above(*score))
        .count() as u64
}

fn remove_in(set: &mut BTreeSet<(i64, String)>, min: ScoreBound, max: ScoreBound) -> u64 {
    let before = set.len();
    set.retain(|(score, _)| !(min.admits_from_below(*score) && max.admits_from_above(*score)));
    (before - set.len()) as u64
}

/// Returns 1 for a new member, 0 when an existing member only had its score updated.
fn add_to(set: &mut BTreeSet<(i64, String)>, score: i64, member: String) -> u64 {
    let existing = set.iter().find(|(_, m)| *m == member).cloned();
    let added = match existing {
        Some(entry) => {
            set.remove(&entry);
            0
        }
        None => 1,
    };
    set.insert((score, member));
    added
}

#[async_trait]
impl ScoredSetStore for MemoryStore {
    async fn count_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<u64, StoreError> {
        Ok(self
            .sets
            .get(key)
            .map(|set| count_in(&set, min, max))
            .unwrap_or(0))
    }

    async fn execute(&self, key: &str, batch: Batch) -> Result<BatchReplies, StoreError> {
        let mut replies = Vec::with_capacity(batch.len());
        let mut set = self.sets.entry(key.to_string()).or_default();

        for command in batch.commands() {
            let reply = match command {
                BatchCommand::RemoveRangeByScore { min, max } => remove_in(&mut set, *min, *max),
                BatchCommand::Add { score, member } => add_to(&mut set, *score, member.clone()),
                BatchCommand::Count { min, max } => count_in(&set, *min, *max),
            };
            replies.push(Ok(reply));
        }

        let empty = set.is_empty();
        drop(set);
        // Redis deletes a sorted set once its last member is removed.
        if empty {
            self.sets.remove_if(key, |_, set| set.is_empty());
        }

        self.observe(&batch);
        self.maybe_sweep();

        Ok(replies)
    }
}
