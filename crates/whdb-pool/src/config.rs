//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a session [`Pool`](crate::Pool).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of idle sessions kept per descriptor.
    pub max_idle_per_descriptor: u32,

    /// How long a session may sit idle before it is discarded.
    pub idle_timeout: Duration,

    /// Whether the pool caches sessions at all.
    pub enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_descriptor: 10,
            idle_timeout: Duration::from_secs(300),
            enabled: true,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of idle sessions per descriptor.
    #[must_use]
    pub fn max_idle_per_descriptor(mut self, count: u32) -> Self {
        self.max_idle_per_descriptor = count;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable or disable caching.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check the configuration for inconsistent values.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.enabled && self.max_idle_per_descriptor == 0 {
            return Err(PoolError::Configuration(
                "max_idle_per_descriptor must be at least 1 when pooling is enabled".into(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(PoolError::Configuration(
                "idle_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected_only_when_enabled() {
        assert!(PoolConfig::new().max_idle_per_descriptor(0).validate().is_err());
        assert!(
            PoolConfig::new()
                .max_idle_per_descriptor(0)
                .enabled(false)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_zero_idle_timeout_rejected() {
        assert!(PoolConfig::new().idle_timeout(Duration::ZERO).validate().is_err());
    }
}
