//! Error types for admission control
//!
//! Being over the limit is not an error: it is reported as a
//! [`Decision`](crate::Decision) with `limited = true`. The variants here are
//! hard failures the caller must handle with its own fail-open or fail-closed
//! policy.

use thiserror::Error;

/// Result type for rate limiting operations
pub type RateLimitResult<T> = Result<T, RateLimitError>;

/// Rate limiting errors
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Store error (Redis, memory, etc.)
    #[error("Rate limit store error: {0}")]
    StoreError(String),

    /// Persisted state could not be interpreted
    #[error("Malformed rate limit state at {key}: {reason}")]
    MalformedState {
        /// Store key holding the bad value
        key: String,
        /// What was wrong with it
        reason: String,
    },

    /// Configuration error
    #[error("Rate limit configuration error: {0}")]
    ConfigError(String),

    /// Tier unit string could not be parsed
    #[error("Invalid time unit: {0:?}")]
    InvalidUnit(String),

    /// An optimistic state update lost a race with another writer
    #[error("Concurrent update conflict on {0}")]
    Conflict(String),

    /// Redis command error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
}

impl RateLimitError {
    /// Create a new store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::StoreError(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Create a malformed state error
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedState {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure came from talking to the store rather than from
    /// the data or configuration
    pub fn is_store_failure(&self) -> bool {
        match self {
            Self::StoreError(_) | Self::Conflict(_) => true,
            #[cfg(feature = "redis")]
            Self::RedisError(_) => true,
            _ => false,
        }
    }
}

#[cfg(feature = "redis")]
impl From<floodgate_redis::RedisError> for RateLimitError {
    fn from(err: floodgate_redis::RedisError) -> Self {
        match err {
            floodgate_redis::RedisError::Redis(e) => Self::RedisError(e),
            floodgate_redis::RedisError::Config(msg) => Self::ConfigError(msg),
            other => Self::StoreError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error() {
        let error = RateLimitError::store("connection refused");
        assert!(error.is_store_failure());
        assert_eq!(
            error.to_string(),
            "Rate limit store error: connection refused"
        );
    }

    #[test]
    fn test_malformed_state() {
        let error = RateLimitError::malformed("rl-app-login-u1", "tokens is not a number");
        assert!(!error.is_store_failure());
        assert!(error.to_string().contains("rl-app-login-u1"));
        assert!(error.to_string().contains("tokens is not a number"));
    }

    #[test]
    fn test_config_errors_are_not_store_failures() {
        assert!(!RateLimitError::config("limit must be greater than 0").is_store_failure());
        assert!(!RateLimitError::InvalidUnit("5X".into()).is_store_failure());
        assert!(RateLimitError::Conflict("k".into()).is_store_failure());
    }
}
