//! Admission strategy trait for swapping rate limiting algorithms.

use async_trait::async_trait;

use super::request::{AdmissionRequest, AdmissionResult};
use crate::error::Result;

/// Trait for admission algorithms.
///
/// This trait keeps the admission decision decoupled from the transport
/// adapter, so the HTTP middleware works with any implementation. Store
/// failures are always returned as errors, never as a default result; the
/// caller decides whether to fail open or closed.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Decide whether the operation described by `request` is admitted.
    async fn evaluate(&self, request: &AdmissionRequest) -> Result<AdmissionResult>;
}
