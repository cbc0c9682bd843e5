//! Tollgate - per-identity admission control
//!
//! This crate decides whether the next action by an identity (an IP address,
//! a user id, any JSON-serializable value) is allowed under a named rule of
//! at most `max` events per `interval`, and records the updated usage in a
//! pluggable store.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{Result, TollgateError};
pub use ratelimit::{Decision, Mode, RateLimiter, Rule, UsageInfo};
pub use store::{MemoryStore, Store, StoreError};
