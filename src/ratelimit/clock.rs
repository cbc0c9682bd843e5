//! Wall-clock time source.
//!
//! Limit states persist absolute timestamps, so time is epoch milliseconds
//! rather than a monotonic `Instant`.

use std::fmt::Debug;
#[cfg(any(test, feature = "test-helpers"))]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(any(test, feature = "test-helpers"))]
use std::sync::Arc;

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + Debug {
    /// Get the current time in epoch milliseconds.
    fn now_millis(&self) -> u64;
}

/// System clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time, so advancing one advances all.
/// Outside this crate it requires the `test-helpers` feature:
/// ```toml
/// [dev-dependencies]
/// tollgate = { version = "*", features = ["test-helpers"] }
/// ```
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    current: Arc<AtomicU64>,
}

#[cfg(any(test, feature = "test-helpers"))]
impl MockClock {
    /// Create a mock clock starting at `start` epoch milliseconds.
    pub fn new(start: u64) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Advance the clock by `millis`.
    pub fn advance(&self, millis: u64) {
        self.current.fetch_add(millis, Ordering::SeqCst);
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, millis: u64) {
        self.current.store(millis, Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl Clock for MockClock {
    fn now_millis(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }
}
