//! Utility functions and helpers
//!
//! This module contains the clock abstraction, timestamp formatting and
//! atomic file writes.

pub mod atomic;
pub mod time;

pub use atomic::{atomic_write_json, atomic_write_with, cleanup_temp_files, AtomicError};
pub use time::{system_clock, to_rfc3339, Clock, FakeClock, SystemClock};
