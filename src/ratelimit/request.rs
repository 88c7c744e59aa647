//! Admission request and result types.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{Result, ZlimitError};

/// A request to admit one operation for a caller.
///
/// The same `key` must be reused across calls for the same caller so that
/// every instance evaluating it shares one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    key: String,
    limit: u64,
    window: Duration,
    window_ms: i64,
}

impl AdmissionRequest {
    /// Build a validated request.
    ///
    /// Fails with [`ZlimitError::InvalidRequest`] when the key is empty, the
    /// limit is zero, or the window is shorter than one millisecond or not a
    /// whole number of milliseconds (record scores have millisecond
    /// resolution).
    pub fn new(key: impl Into<String>, limit: u64, window: Duration) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(ZlimitError::InvalidRequest("key must not be empty".to_string()));
        }
        if limit == 0 {
            return Err(ZlimitError::InvalidRequest("limit must be positive".to_string()));
        }
        let window_ms = TimeDelta::from_std(window)
            .map_err(|_| ZlimitError::InvalidRequest(format!("window {:?} is too large", window)))?
            .num_milliseconds();
        if window_ms <= 0 {
            return Err(ZlimitError::InvalidRequest(format!(
                "window must be at least 1ms, got {:?}",
                window
            )));
        }
        if window.subsec_nanos() % 1_000_000 != 0 {
            return Err(ZlimitError::InvalidRequest(format!(
                "window must be a whole number of milliseconds, got {:?}",
                window
            )));
        }

        Ok(Self {
            key,
            limit,
            window,
            window_ms,
        })
    }

    /// The caller key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Maximum admitted operations per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// The rolling window duration.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The window in whole milliseconds.
    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }
}

/// Outcome of one admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmissionState {
    Allow,
    Deny,
}

impl AdmissionState {
    /// Fixed name used in observability metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionState::Allow => "Allow",
            AdmissionState::Deny => "Deny",
        }
    }
}

impl fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of evaluating an [`AdmissionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionResult {
    /// Allow or deny.
    pub state: AdmissionState,
    /// Activity recorded in the window: includes the just-recorded operation
    /// when allowed, pre-existing activity when denied.
    pub total_requests: u64,
    /// Evaluation time plus the window duration. Advisory only: records in a
    /// sliding window expire one by one.
    pub expires_at: DateTime<Utc>,
}

impl AdmissionResult {
    pub fn allow(total_requests: u64, expires_at: DateTime<Utc>) -> Self {
        Self {
            state: AdmissionState::Allow,
            total_requests,
            expires_at,
        }
    }

    pub fn deny(total_requests: u64, expires_at: DateTime<Utc>) -> Self {
        Self {
            state: AdmissionState::Deny,
            total_requests,
            expires_at,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.state == AdmissionState::Allow
    }
}
