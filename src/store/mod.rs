//! Shared ordered-score store abstraction.
//!
//! Activity records live in a sorted set per caller key: the score is the
//! admission timestamp in epoch milliseconds and the member is a unique id.
//! Implementations must support counting and removing by score range,
//! inserting with a score, and sending several such commands in one round
//! trip.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, DEFAULT_KEY_PREFIX};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a [`ScoredSetStore`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached (refused, dropped, I/O failure).
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// The store answered with an error for a command.
    #[error("store command failed: {0}")]
    Command(String),

    /// The round trip did not finish within the operation timeout.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Whether the store should be treated as unreachable for this call.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// One end of a score range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreBound {
    /// Negative infinity.
    NegInf,
    /// Positive infinity.
    PosInf,
    /// The score itself is part of the range.
    Inclusive(i64),
    /// The score itself is not part of the range.
    Exclusive(i64),
}

impl ScoreBound {
    /// Whether `score` satisfies this bound used as a range minimum.
    pub fn admits_from_below(&self, score: i64) -> bool {
        match *self {
            ScoreBound::NegInf => true,
            ScoreBound::PosInf => false,
            ScoreBound::Inclusive(min) => score >= min,
            ScoreBound::Exclusive(min) => score > min,
        }
    }

    /// Whether `score` satisfies this bound used as a range maximum.
    pub fn admits_from_above(&self, score: i64) -> bool {
        match *self {
            ScoreBound::NegInf => false,
            ScoreBound::PosInf => true,
            ScoreBound::Inclusive(max) => score <= max,
            ScoreBound::Exclusive(max) => score < max,
        }
    }
}

/// Renders the bound in Redis' ZRANGEBYSCORE syntax.
impl fmt::Display for ScoreBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreBound::NegInf => write!(f, "-inf"),
            ScoreBound::PosInf => write!(f, "+inf"),
            ScoreBound::Inclusive(score) => write!(f, "{}", score),
            ScoreBound::Exclusive(score) => write!(f, "({}", score),
        }
    }
}

/// A single command inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchCommand {
    /// Remove every member whose score lies within `[min, max]`.
    RemoveRangeByScore { min: ScoreBound, max: ScoreBound },
    /// Insert `member` with `score`.
    Add { score: i64, member: String },
    /// Count members whose score lies within `[min, max]`.
    Count { min: ScoreBound, max: ScoreBound },
}

impl BatchCommand {
    /// Short name of the command, used in error messages.
    pub fn operation(&self) -> &'static str {
        match self {
            BatchCommand::RemoveRangeByScore { .. } => "remove stale records",
            BatchCommand::Add { .. } => "add record",
            BatchCommand::Count { .. } => "count records",
        }
    }
}

/// Commands against one key that are sent to the store in a single round trip.
///
/// No isolation across the batch is implied; other writers may interleave
/// unless the concrete store says otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    commands: Vec<BatchCommand>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a remove-by-score-range command.
    pub fn remove_range_by_score(mut self, min: ScoreBound, max: ScoreBound) -> Self {
        self.commands
            .push(BatchCommand::RemoveRangeByScore { min, max });
        self
    }

    /// Queue an insert.
    pub fn add(mut self, score: i64, member: impl Into<String>) -> Self {
        self.commands.push(BatchCommand::Add {
            score,
            member: member.into(),
        });
        self
    }

    /// Queue a count-by-score-range command.
    pub fn count(mut self, min: ScoreBound, max: ScoreBound) -> Self {
        self.commands.push(BatchCommand::Count { min, max });
        self
    }

    /// The queued commands, in submission order.
    pub fn commands(&self) -> &[BatchCommand] {
        &self.commands
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Per-command replies of an executed [`Batch`], in submission order.
///
/// Every reply is an integer: members removed, members added, or members
/// counted.
pub type BatchReplies = Vec<std::result::Result<u64, StoreError>>;

/// The shared ordered-score store consumed by the admission strategies.
///
/// The store is multi-writer: callers never assume they are the only process
/// touching a key.
#[async_trait]
pub trait ScoredSetStore: Send + Sync {
    /// Count members of `key` whose score lies within `[min, max]`.
    async fn count_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> std::result::Result<u64, StoreError>;

    /// Send every command of `batch` against `key` in one round trip.
    ///
    /// The outer error means the batch as a whole failed to execute; the
    /// inner results report each command individually.
    async fn execute(
        &self,
        key: &str,
        batch: Batch,
    ) -> std::result::Result<BatchReplies, StoreError>;
}
