//! Ledger configuration.

use thiserror::Error;

use crate::recent_ops::DEFAULT_CAPACITY;

/// Environment variable overriding [`LedgerConfig::recent_ops_capacity`].
pub const RECENT_OPS_ENV: &str = "LEDGER_RECENT_OPS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    InvalidCapacity { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Operations kept per user in the recent-operations log.
    pub recent_ops_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            recent_ops_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl LedgerConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(RECENT_OPS_ENV) {
            config.recent_ops_capacity = match value.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => capacity,
                _ => {
                    return Err(ConfigError::InvalidCapacity {
                        var: RECENT_OPS_ENV,
                        value,
                    });
                }
            };
        }

        Ok(config)
    }
}
