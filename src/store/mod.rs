//! Storage contract for limit state.
//!
//! The limiter never interprets stored values: it reads the state string a
//! mode produced earlier, hands it back to that mode, and writes the result
//! with the TTL the mode computed.

mod memory;

pub use memory::{MaintenanceHandle, MemoryStore};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// An error raised by a store backend.
///
/// Backends wrap their own error type; the limiter propagates it unchanged.
#[derive(Debug, Error)]
#[error("{inner}")]
pub struct StoreError {
    #[source]
    inner: Box<dyn std::error::Error + Send + Sync>,
}

impl StoreError {
    /// Wrap a backend error.
    pub fn new(inner: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            inner: inner.into(),
        }
    }
}

/// Trait for limit state stores.
///
/// The limiter performs `get`, evaluates, then `set`. These two calls are not
/// atomic with respect to each other, so two writers racing on one key can
/// lose an update. Stores that guarantee multi-writer safety on their own
/// (for example by serializing all access to a key server-side) report it via
/// [`Store::multi_writer_safe`]; for every other store the limiter can gate
/// writers per key inside the process.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read the current state for a key, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write the state for a key, to be forgotten after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Whether concurrent read-modify-write cycles on one key are safe.
    fn multi_writer_safe(&self) -> bool {
        false
    }
}
