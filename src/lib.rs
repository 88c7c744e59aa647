//! Zlimit - Distributed Sliding-Window Rate Limiting
//!
//! This crate decides whether each operation of a caller is admitted so that
//! no caller exceeds a quota of N operations within a rolling window. The
//! window state lives in a shared sorted-set store (Redis), so any number of
//! service instances can evaluate the same caller.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
