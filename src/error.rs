//! Error types for Tollgate.

use thiserror::Error;

use crate::ratelimit::UsageInfo;
use crate::store::StoreError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// No rule is registered under the name and none was supplied inline
    #[error("Rule for {0} not defined")]
    RuleNotFound(String),

    /// A rule definition was rejected during construction
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// The identity is over its limit
    #[error("Rate limit exceeded")]
    Rejected {
        /// Usage reported by the mode that denied the request
        info: Option<UsageInfo>,
    },

    /// The store failed during a read or write
    #[error("Store error: {source}")]
    Store {
        source: StoreError,
        /// Usage computed before the failing write, if the read succeeded
        info: Option<UsageInfo>,
    },

    /// The identity could not be serialized into a key
    #[error("Identity serialization error: {0}")]
    Identity(#[from] serde_json::Error),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error is an over-limit signal rather than a fault.
    pub fn is_rejected(&self) -> bool {
        matches!(self, TollgateError::Rejected { .. })
    }

    /// Usage info attached to a rejection or a write-phase store failure.
    pub fn info(&self) -> Option<&UsageInfo> {
        match self {
            TollgateError::Rejected { info } | TollgateError::Store { info, .. } => info.as_ref(),
            _ => None,
        }
    }
}

impl From<StoreError> for TollgateError {
    fn from(source: StoreError) -> Self {
        TollgateError::Store { source, info: None }
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
