//! Rate limiting rules, algorithms and the limiter itself.

mod clock;
mod key;
mod limiter;
mod modes;
mod rules;

pub use clock::{Clock, SystemClock};
#[cfg(any(test, feature = "test-helpers"))]
pub use clock::MockClock;
pub use key::{canonical_json, derive_key, hash};
pub use limiter::{DropTally, LimiterOptions, RateLimiter};
pub use modes::{ContinuousMode, Decision, IntervalMode, LimitState, ModeAlgorithm, UsageInfo};
pub use rules::{Mode, ModeName, Rule, RuleDefinition, RuleRegistry};
