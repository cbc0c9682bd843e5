//! Counting algorithms.
//!
//! A mode is a pure function of a rule, the state it stored last time and the
//! current time. It never touches the store, which is what lets a read-only
//! check share the exact computation of a committing drop.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::rules::Rule;

/// Usage metadata reported by bucket-style modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    /// Events counted in the current window, including this one
    pub count: u64,
    /// Epoch milliseconds at which the current window ends
    pub bucket: u64,
}

/// The outcome of evaluating a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether this event is over the limit
    pub limited: bool,
    /// State to persist if the event is committed
    pub next: String,
    /// How long the persisted state stays relevant
    pub expiration: Duration,
    /// Caller-visible usage, when the mode reports it
    pub info: Option<UsageInfo>,
}

/// Trait for counting algorithms.
///
/// Implementations own the encoding of the state string they return in
/// [`Decision::next`]; it is handed back verbatim as `previous` on the next
/// evaluation for the same key, or `None` once the store has forgotten it.
pub trait ModeAlgorithm: Send + Sync {
    /// Charge one event against `rule` at `now` (epoch milliseconds).
    fn evaluate(&self, rule: &Rule, previous: Option<&str>, now: u64) -> Decision;
}

impl<F> ModeAlgorithm for F
where
    F: Fn(&Rule, Option<&str>, u64) -> Decision + Send + Sync,
{
    fn evaluate(&self, rule: &Rule, previous: Option<&str>, now: u64) -> Decision {
        self(rule, previous, now)
    }
}

/// Stored state of the built-in modes, encoded as `"count:timestamp"`.
///
/// The continuous mode stores a fractional count and the time of the last
/// event; the interval mode stores a whole count and the window end.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LimitState {
    /// Usage counted so far
    pub count: f64,
    /// Last event time (continuous) or window end (interval), in epoch ms
    pub timestamp: u64,
}

impl LimitState {
    /// Parse a stored state. Returns `None` for anything malformed.
    pub fn parse(raw: &str) -> Option<Self> {
        let (count, timestamp) = raw.split_once(':')?;
        let count: f64 = count.parse().ok()?;
        if !count.is_finite() || count < 0.0 {
            return None;
        }

        Some(Self {
            count,
            timestamp: timestamp.parse().ok()?,
        })
    }

    /// Decode the previous state, treating absent or corrupt values as no usage.
    fn decode(previous: Option<&str>) -> Self {
        match previous {
            None => Self::default(),
            Some(raw) => Self::parse(raw).unwrap_or_else(|| {
                warn!(state = %raw, "Discarding unparsable limit state");
                Self::default()
            }),
        }
    }
}

impl fmt::Display for LimitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.count, self.timestamp)
    }
}

/// Leaky-bucket style linear decay.
///
/// Usage drains at one unit per `interval / max`, computed lazily from the
/// time since the last event, so `max` back-to-back events fill the bucket
/// and it takes the full interval to drain it again.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinuousMode;

impl ModeAlgorithm for ContinuousMode {
    fn evaluate(&self, rule: &Rule, previous: Option<&str>, now: u64) -> Decision {
        let state = LimitState::decode(previous);
        let unit_time = rule.unit_time_millis();

        // A clock that went backwards counts as no time passing
        let elapsed = now.saturating_sub(state.timestamp) as f64;
        let count = (state.count - elapsed / unit_time).max(0.0) + 1.0;

        Decision {
            limited: count > rule.max() as f64,
            next: LimitState {
                count,
                timestamp: now,
            }
            .to_string(),
            expiration: Duration::from_millis((count * unit_time).ceil() as u64),
            info: None,
        }
    }
}

/// Fixed window bucket.
///
/// The first event at or after the stored window end opens a new window of
/// one interval starting now.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalMode;

impl ModeAlgorithm for IntervalMode {
    fn evaluate(&self, rule: &Rule, previous: Option<&str>, now: u64) -> Decision {
        let state = LimitState::decode(previous);
        let mut count = state.count as u64;
        let mut bucket = state.timestamp;

        if now >= bucket {
            count = 0;
            bucket = now.saturating_add(rule.interval_millis());
        }
        // A poisoned huge count must not overflow
        count = count.saturating_add(1);

        Decision {
            limited: count > rule.max(),
            next: format!("{}:{}", count, bucket),
            expiration: rule.interval(),
            info: Some(UsageInfo { count, bucket }),
        }
    }
}
