//! Admission decisions and the algorithms behind them.

mod clock;
mod request;
mod scripted;
mod sliding_window;
mod strategy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use request::{AdmissionRequest, AdmissionResult, AdmissionState};
pub use scripted::ScriptedSlidingWindow;
pub use sliding_window::{SlidingWindowCounter, DEFAULT_OPERATION_TIMEOUT};
pub use strategy::Strategy;
