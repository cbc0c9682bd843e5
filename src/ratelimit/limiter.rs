//! Core rate limiter implementation.
//!
//! Every operation follows the same sequence: resolve the rule, derive the
//! key, read the previous state, evaluate the mode, and (for `drop`) write
//! the next state back.
//!
//! The read and the write are separate store calls. Two `drop`s for one key
//! that interleave between them can both see the same previous state, and
//! the later write then discards the earlier increment. When the store does
//! not declare itself multi-writer-safe, the limiter closes that window
//! within this process by holding a per-key gate from read to write. It
//! cannot do so across processes sharing one store.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinError;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::key::derive_key;
use super::modes::Decision;
use super::rules::{Rule, RuleRegistry};
use crate::config::TollgateConfig;
use crate::error::{Result, TollgateError};
use crate::store::{MaintenanceHandle, MemoryStore, Store};

/// Behaviour fixed at limiter construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterOptions {
    /// Commit the state of denied `drop`s too, so usage keeps growing past the limit
    pub overflow: bool,
    /// Gate concurrent `drop`s per key when the store is not multi-writer-safe
    pub serialize_writes: bool,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            overflow: false,
            serialize_writes: true,
        }
    }
}

/// The rate limiter that evaluates rules against stored usage.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    rules: RuleRegistry,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    options: LimiterOptions,
    gates: KeyGates,
    memory: Option<Arc<MemoryStore>>,
    maintenance: SyncMutex<Option<MaintenanceHandle>>,
}

impl RateLimiter {
    /// Create a limiter over `store` with default options.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_options(store, LimiterOptions::default())
    }

    /// Create a limiter over `store` with the given options.
    pub fn with_options(store: Arc<dyn Store>, options: LimiterOptions) -> Self {
        Self {
            rules: RuleRegistry::new(),
            store,
            clock: Arc::new(SystemClock::new()),
            options,
            gates: KeyGates::default(),
            memory: None,
            maintenance: SyncMutex::new(None),
        }
    }

    /// Create a limiter from configuration, registering every configured rule.
    pub fn from_config(config: &TollgateConfig, store: Arc<dyn Store>) -> Result<Self> {
        let limiter = Self::with_options(store, config.limiter.options());
        for (name, definition) in &config.rules {
            limiter.register_rule(name.clone(), Rule::try_from(definition)?);
        }
        Ok(limiter)
    }

    /// Create a limiter over its own [`MemoryStore`], swept in the background
    /// every `limiter.maintenance_interval_ms`.
    ///
    /// Must be called within a tokio runtime. The sweep runs until
    /// [`RateLimiter::shutdown`] or until the limiter is dropped.
    pub fn with_memory_store(config: &TollgateConfig) -> Result<Self> {
        Self::with_memory_store_and_clock(config, Arc::new(SystemClock::new()))
    }

    /// Like [`RateLimiter::with_memory_store`], with the limiter and store
    /// sharing `clock`.
    pub fn with_memory_store_and_clock(
        config: &TollgateConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = Arc::new(MemoryStore::with_clock(Arc::clone(&clock)));
        let mut limiter = Self::from_config(config, store.clone())?.with_clock(clock);

        let handle = store.spawn_maintenance(config.limiter.maintenance_interval());
        *limiter.maintenance.get_mut() = Some(handle);
        limiter.memory = Some(store);
        Ok(limiter)
    }

    /// Replace the clock used to timestamp evaluations.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a rule under `name`, replacing any previous one.
    pub fn register_rule(&self, name: impl Into<String>, rule: Rule) -> &Self {
        self.rules.register(name, rule);
        self
    }

    /// Look up a registered rule.
    pub fn rule(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.get(name)
    }

    /// The options this limiter was built with.
    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// The store this limiter owns, when built with [`RateLimiter::with_memory_store`].
    pub fn memory_store(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    /// Whether a store maintenance task owned by this limiter is running.
    pub fn is_maintaining(&self) -> bool {
        self.maintenance
            .lock()
            .as_ref()
            .is_some_and(MaintenanceHandle::is_running)
    }

    /// Stop the store maintenance task this limiter owns, if any, and wait for it.
    ///
    /// Evaluations keep working afterwards; expired states are then only
    /// hidden on read, never reclaimed.
    pub async fn shutdown(&self) -> std::result::Result<(), JoinError> {
        let handle = self.maintenance.lock().take();
        match handle {
            Some(handle) => {
                info!("Stopping limiter");
                handle.shutdown().await
            }
            None => Ok(()),
        }
    }

    /// Evaluate the next event for `identity` without recording it.
    ///
    /// `rule` overrides any rule registered under `rule_name`. Returns
    /// [`TollgateError::Rejected`] when the event would be over the limit and
    /// overflow is disabled; with overflow enabled the decision is returned
    /// and `limited` tells the caller the outcome.
    pub async fn check_limited<I>(
        &self,
        rule_name: &str,
        identity: &I,
        rule: Option<&Rule>,
    ) -> Result<Decision>
    where
        I: Serialize + ?Sized,
    {
        let rule = self.resolve_rule(rule_name, rule)?;
        let key = derive_key(rule_name, identity)?;

        let decision = self.evaluate(&key, &rule).await?;
        if decision.limited && !self.options.overflow {
            return Err(TollgateError::Rejected {
                info: decision.info,
            });
        }

        Ok(decision)
    }

    /// Record an event for `identity` and decide whether it is allowed.
    ///
    /// `rule` overrides any rule registered under `rule_name`. A denied event
    /// is not written unless overflow is enabled, so it consumes no further
    /// allowance; with overflow the state is committed and the event is
    /// still rejected.
    ///
    /// Through an `Arc<RateLimiter>` or `Box<RateLimiter>`, method syntax
    /// resolves to [`Drop::drop`] of the pointer; call
    /// `RateLimiter::drop(&limiter, ...)` there instead.
    pub async fn drop<I>(
        &self,
        rule_name: &str,
        identity: &I,
        rule: Option<&Rule>,
    ) -> Result<Decision>
    where
        I: Serialize + ?Sized,
    {
        let rule = self.resolve_rule(rule_name, rule)?;
        let key = derive_key(rule_name, identity)?;

        let _gate = if self.options.serialize_writes && !self.store.multi_writer_safe() {
            Some(self.gates.lock(&key).await)
        } else {
            None
        };

        let decision = self.evaluate(&key, &rule).await?;

        if decision.limited && !self.options.overflow {
            debug!(key = %key, info = ?decision.info, "Rate limit exceeded");
            return Err(TollgateError::Rejected {
                info: decision.info,
            });
        }

        self.store
            .set(&key, decision.next.clone(), decision.expiration)
            .await
            .map_err(|source| TollgateError::Store {
                source,
                info: decision.info,
            })?;

        if decision.limited {
            debug!(key = %key, info = ?decision.info, "Rate limit exceeded, usage committed");
            return Err(TollgateError::Rejected {
                info: decision.info,
            });
        }

        Ok(decision)
    }

    fn resolve_rule(&self, rule_name: &str, inline: Option<&Rule>) -> Result<Arc<Rule>> {
        match inline {
            Some(rule) => Ok(Arc::new(rule.clone())),
            None => self
                .rules
                .get(rule_name)
                .ok_or_else(|| TollgateError::RuleNotFound(rule_name.to_string())),
        }
    }

    async fn evaluate(&self, key: &str, rule: &Rule) -> Result<Decision> {
        let previous = self.store.get(key).await?;
        let now = self.clock.now_millis();
        let decision = rule.evaluate(previous.as_deref(), now);

        trace!(
            key = %key,
            mode = rule.mode().name(),
            previous = ?previous,
            next = %decision.next,
            limited = decision.limited,
            "Evaluated rate limit"
        );

        Ok(decision)
    }

    #[cfg(test)]
    fn open_gates(&self) -> usize {
        self.gates.gates.len()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rules", &self.rules.len())
            .field("options", &self.options)
            .field("multi_writer_safe_store", &self.store.multi_writer_safe())
            .field("maintaining", &self.is_maintaining())
            .finish()
    }
}

/// Per-key async mutexes, created on demand and dropped once unused.
#[derive(Debug, Default)]
struct KeyGates {
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyGates {
    async fn lock(&self, key: &str) -> GateGuard<'_> {
        // The map shard lock must be released before awaiting the gate
        let gate = self.gates.entry(key.to_string()).or_default().clone();
        let guard = gate.lock_owned().await;

        GateGuard {
            gates: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }
}

struct GateGuard<'a> {
    gates: &'a KeyGates,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or awaits this gate
        self.gates
            .gates
            .remove_if(&self.key, |_, gate| Arc::strong_count(gate) == 1);
    }
}

/// Counts of how a batch of drops was decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropTally {
    pub allowed: u64,
    pub rejected: u64,
}

impl DropTally {
    /// Record the outcome of one drop.
    ///
    /// Faults other than rejection are returned unchanged.
    pub fn record(&mut self, outcome: Result<Decision>) -> Result<()> {
        match outcome {
            Ok(_) => self.allowed += 1,
            Err(err) if err.is_rejected() => self.rejected += 1,
            Err(err) => return Err(err),
        }
        Ok(())
    }
}
