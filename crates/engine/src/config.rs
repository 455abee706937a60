//! Engine configuration.
//!
//! Usually embedded in the `[engine]` table of the server's TOML file:
//!
//! ```toml
//! [engine]
//! default_expiry_days = 14
//! max_expiry_days = 365
//! max_commit_attempts = 8
//! token_bytes = 32
//! sweep_interval_secs = 300
//! ```

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::error::EnvelopeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Expiry applied when a create request names none.
    pub default_expiry_days: u32,
    pub max_expiry_days: u32,
    /// Bound on read-compute-commit retries after a version conflict.
    pub max_commit_attempts: u32,
    /// Random bytes per signer token (hex encoded on the wire).
    pub token_bytes: usize,
    /// Interval of the background expiry sweep in `quire serve`.
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_expiry_days: 14,
            max_expiry_days: 365,
            max_commit_attempts: 8,
            token_bytes: 32,
            sweep_interval_secs: 300,
        }
    }
}

impl EngineConfig {
    /// Check the values are usable. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.default_expiry_days == 0 || self.default_expiry_days > self.max_expiry_days {
            errors.push(format!(
                "default_expiry_days must be in 1..={}, got {}",
                self.max_expiry_days, self.default_expiry_days
            ));
        }
        if self.max_commit_attempts == 0 {
            errors.push("max_commit_attempts must be at least 1".to_string());
        }
        if self.token_bytes < 16 {
            errors.push(format!(
                "token_bytes must be at least 16, got {}",
                self.token_bytes
            ));
        }
        if self.sweep_interval_secs == 0 {
            errors.push("sweep_interval_secs must be at least 1".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Resolve a requested expiry window.
    pub fn expiry(&self, requested_days: Option<u32>) -> Result<Duration, EnvelopeError> {
        let days = requested_days.unwrap_or(self.default_expiry_days);
        if days == 0 || days > self.max_expiry_days {
            return Err(EnvelopeError::InvalidRequest {
                message: format!(
                    "expires_in_days must be in 1..={}, got {}",
                    self.max_expiry_days, days
                ),
            });
        }
        Ok(Duration::days(i64::from(days)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.expiry(None).unwrap(), Duration::days(14));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_commit_attempts": 3}"#).unwrap();
        assert_eq!(config.max_commit_attempts, 3);
        assert_eq!(config.default_expiry_days, 14);
    }

    #[test]
    fn expiry_out_of_range_rejected() {
        let config = EngineConfig::default();
        assert!(config.expiry(Some(0)).is_err());
        assert!(config.expiry(Some(366)).is_err());
        assert_eq!(config.expiry(Some(365)).unwrap(), Duration::days(365));
    }

    #[test]
    fn validate_reports_every_problem() {
        let config = EngineConfig {
            default_expiry_days: 0,
            max_expiry_days: 365,
            max_commit_attempts: 0,
            token_bytes: 4,
            sweep_interval_secs: 0,
        };
        assert_eq!(config.validate().unwrap_err().len(), 4);
    }
}
