//! Rate limit rules and the named rule registry.
//!
//! A rule is a maximum count over an interval plus the mode that counts
//! against it. Rules are validated when built and are immutable afterwards;
//! the registry maps names to shared rules.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::modes::{ContinuousMode, Decision, IntervalMode, ModeAlgorithm};
use crate::error::{Result, TollgateError};

/// How usage is counted against a rule.
///
/// The variant is chosen when the rule is built, so evaluation never has to
/// look a mode up by name.
#[derive(Clone, Default)]
pub enum Mode {
    /// Usage drains linearly over time
    #[default]
    Continuous,
    /// Usage resets at fixed window boundaries
    Interval,
    /// Caller-provided algorithm
    Custom(Arc<dyn ModeAlgorithm>),
}

impl Mode {
    /// Wrap a custom algorithm.
    pub fn custom<A: ModeAlgorithm + 'static>(algorithm: A) -> Self {
        Mode::Custom(Arc::new(algorithm))
    }

    /// Wrap a plain function or closure as a custom algorithm.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Rule, Option<&str>, u64) -> Decision + Send + Sync + 'static,
    {
        Mode::Custom(Arc::new(f))
    }

    /// The algorithm evaluating this mode.
    pub fn algorithm(&self) -> &dyn ModeAlgorithm {
        match self {
            Mode::Continuous => &ContinuousMode,
            Mode::Interval => &IntervalMode,
            Mode::Custom(algorithm) => algorithm.as_ref(),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Continuous => "continuous",
            Mode::Interval => "interval",
            Mode::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A validated rate limit rule.
#[derive(Debug, Clone)]
pub struct Rule {
    max: u64,
    interval: Duration,
    mode: Mode,
}

impl Rule {
    /// Create a continuous-mode rule allowing `max` events per `interval`.
    ///
    /// Fails if `max` is zero or `interval` is shorter than a millisecond.
    pub fn new(max: u64, interval: Duration) -> Result<Self> {
        if max == 0 {
            return Err(TollgateError::InvalidRule(
                "max must be at least 1".to_string(),
            ));
        }
        if interval.as_millis() == 0 {
            return Err(TollgateError::InvalidRule(
                "interval must be at least 1ms".to_string(),
            ));
        }

        Ok(Self {
            max,
            interval,
            mode: Mode::default(),
        })
    }

    /// Replace the counting mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Maximum events allowed per interval.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// The interval the maximum applies to.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The interval in whole milliseconds.
    pub fn interval_millis(&self) -> u64 {
        u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX)
    }

    /// Milliseconds it takes for one unit of usage to drain.
    pub fn unit_time_millis(&self) -> f64 {
        self.interval_millis() as f64 / self.max as f64
    }

    /// The counting mode.
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Evaluate this rule against a previous state at `now` (epoch ms).
    pub fn evaluate(&self, previous: Option<&str>, now: u64) -> Decision {
        self.mode.algorithm().evaluate(self, previous, now)
    }
}

/// Mode names accepted in configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeName {
    #[default]
    Continuous,
    Interval,
}

impl From<ModeName> for Mode {
    fn from(name: ModeName) -> Self {
        match name {
            ModeName::Continuous => Mode::Continuous,
            ModeName::Interval => Mode::Interval,
        }
    }
}

/// A rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Maximum events allowed per interval
    pub max: u64,
    /// Interval length in milliseconds
    pub interval_ms: u64,
    /// Counting mode
    #[serde(default)]
    pub mode: ModeName,
}

impl TryFrom<&RuleDefinition> for Rule {
    type Error = TollgateError;

    fn try_from(definition: &RuleDefinition) -> Result<Self> {
        Ok(Rule::new(definition.max, Duration::from_millis(definition.interval_ms))?
            .with_mode(definition.mode.into()))
    }
}

/// Named rules shared by a limiter.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<Rule>>>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule, replacing any rule already under `name`.
    pub fn register(&self, name: impl Into<String>, rule: Rule) {
        let name = name.into();
        debug!(
            rule = %name,
            max = rule.max(),
            interval_ms = rule.interval_millis(),
            mode = rule.mode().name(),
            "Registering rule"
        );
        self.rules.write().insert(name, Arc::new(rule));
    }

    /// Look up a rule by name.
    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.read().get(name).cloned()
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Whether no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_defaults_to_continuous() {
        let rule = Rule::new(5, Duration::from_millis(100)).unwrap();
        assert!(matches!(rule.mode(), Mode::Continuous));
        assert_eq!(rule.interval_millis(), 100);
        assert_eq!(rule.unit_time_millis(), 20.0);
    }

    #[test]
    fn test_rule_validation() {
        let err = Rule::new(0, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, TollgateError::InvalidRule(_)));

        let err = Rule::new(5, Duration::ZERO).unwrap_err();
        assert!(matches!(err, TollgateError::InvalidRule(_)));

        let err = Rule::new(5, Duration::from_micros(500)).unwrap_err();
        assert!(matches!(err, TollgateError::InvalidRule(_)));
    }

    #[test]
    fn test_mode_resolution() {
        assert_eq!(Mode::default().name(), "continuous");
        assert_eq!(Mode::from(ModeName::Interval).name(), "interval");

        let custom = Mode::from_fn(|_rule: &Rule, _previous: Option<&str>, _now: u64| Decision {
            limited: true,
            next: "x".to_string(),
            expiration: Duration::from_millis(1),
            info: None,
        });
        assert_eq!(custom.name(), "custom");

        let rule = Rule::new(1, Duration::from_millis(10))
            .unwrap()
            .with_mode(custom);
        let decision = rule.evaluate(None, 0);
        assert!(decision.limited);
        assert_eq!(decision.next, "x");
    }

    #[test]
    fn test_parse_rule_definition() {
        let yaml = r#"
max: 10
interval_ms: 60000
mode: interval
"#;
        let definition: RuleDefinition = serde_yaml::from_str(yaml).unwrap();
        let rule = Rule::try_from(&definition).unwrap();
        assert_eq!(rule.max(), 10);
        assert_eq!(rule.interval(), Duration::from_secs(60));
        assert_eq!(rule.mode().name(), "interval");
    }

    #[test]
    fn test_rule_definition_mode_is_optional() {
        let definition: RuleDefinition = serde_yaml::from_str("max: 3\ninterval_ms: 1000\n").unwrap();
        assert_eq!(definition.mode, ModeName::Continuous);
    }

    #[test]
    fn test_invalid_rule_definition() {
        let definition = RuleDefinition {
            max: 0,
            interval_ms: 1000,
            mode: ModeName::Continuous,
        };
        assert!(Rule::try_from(&definition).is_err());
    }

    #[test]
    fn test_registry_overwrites() {
        let registry = RuleRegistry::new();
        assert!(registry.is_empty());

        registry.register("login", Rule::new(5, Duration::from_millis(100)).unwrap());
        registry.register("login", Rule::new(7, Duration::from_millis(100)).unwrap());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("login").unwrap().max(), 7);
        assert!(registry.get("signup").is_none());
    }
}
