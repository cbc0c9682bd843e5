//! In-process reference store.
//!
//! Entries carry an absolute expiry. Reads ignore expired entries right away;
//! memory is reclaimed by [`MemoryStore::maintain`], usually driven by the
//! background task returned from [`MemoryStore::spawn_maintenance`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::{Store, StoreError};
use crate::ratelimit::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct StoredEntry {
    value: String,
    /// Epoch milliseconds after which the entry is stale
    expires_at: u64,
}

/// A `DashMap`-backed store with lazy expiry and periodic sweeping.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store that reads time from the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store with a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry whose expiry has passed. Returns how many were removed.
    ///
    /// Expiry is judged under the shard lock against the entry as it is at
    /// that moment, so a key rewritten after its previous expiry is kept.
    pub fn maintain(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            let keep = entry.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });

        removed
    }

    /// Start sweeping expired entries every `every` on the current tokio runtime.
    ///
    /// The task runs until [`MaintenanceHandle::shutdown`] is awaited or the
    /// handle is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, every: Duration) -> MaintenanceHandle {
        let every = every.max(Duration::from_millis(1));
        let store = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        info!(interval_ms = every.as_millis() as u64, "Starting memory store maintenance");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let removed = store.maintain();
                        if removed > 0 {
                            debug!(
                                removed = removed,
                                remaining = store.len(),
                                "Swept expired limit states"
                            );
                        }
                    }
                }
            }

            info!("Memory store maintenance stopped");
        });

        MaintenanceHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone());

        trace!(key = %key, hit = value.is_some(), "Memory store read");
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let expires_at = self.clock.now_millis().saturating_add(ttl_ms);

        self.entries
            .insert(key.to_string(), StoredEntry { value, expires_at });
        Ok(())
    }
}

/// Owner of a running maintenance task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(mut self) -> Result<(), JoinError> {
        if let Some(tx) = self.shutdown.take() {
            // The task may already have exited; nothing to signal then
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MockClock;

    fn store_at(start: u64) -> (Arc<MemoryStore>, MockClock) {
        let clock = MockClock::new(start);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (store, clock)
    }

    #[tokio::test]
    async fn test_get_and_set() {
        let (store, _clock) = store_at(0);

        store
            .set("foo", "bar".to_string(), Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(store.get("foo").await.unwrap(), Some("bar".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_values_are_hidden_before_sweep() {
        let (store, clock) = store_at(0);

        store
            .set("foo", "bar".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        clock.advance(20);

        assert_eq!(store.get("foo").await.unwrap(), None);
        // Still occupying memory until maintained
        assert_eq!(store.len(), 1);
        assert_eq!(store.maintain(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_refreshed_value_survives_maintenance() {
        let (store, clock) = store_at(0);

        store
            .set("foo", "bar".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        clock.advance(8);
        store
            .set("foo", "baz".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        clock.advance(8);

        // Past the first expiry (10) but before the second (18)
        assert_eq!(store.maintain(), 0);
        assert_eq!(store.get("foo").await.unwrap(), Some("baz".to_string()));
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_exclusive() {
        let (store, clock) = store_at(100);

        store
            .set("foo", "bar".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        clock.set(109);
        assert!(store.get("foo").await.unwrap().is_some());

        clock.set(110);
        assert!(store.get("foo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_background_maintenance_sweeps_and_stops() {
        let (store, clock) = store_at(0);

        store
            .set("stale", "1:0".to_string(), Duration::from_millis(5))
            .await
            .unwrap();
        store
            .set("fresh", "1:0".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        clock.advance(10);

        let handle = store.spawn_maintenance(Duration::from_millis(10));
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.len(), 1);
        assert!(store.get("fresh").await.unwrap().is_some());

        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_default_store_is_not_multi_writer_safe() {
        assert!(!MemoryStore::new().multi_writer_safe());
    }
}
