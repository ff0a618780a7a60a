//! Runtime configuration for the sensor core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shortest decision timeout the pipeline will accept.
pub const MIN_DECISION_TIMEOUT: Duration = Duration::from_millis(100);

/// Longest decision timeout the pipeline will accept.
pub const MAX_DECISION_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacities and timeouts for the caches, channels, and pipeline.
///
/// All bounds are fixed at service start; nothing in the core resizes at
/// runtime.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use vigil_core::config::SensorConfig;
///
/// let config = SensorConfig::default()
///     .with_decision_timeout(Duration::from_millis(500))
///     .with_cache_capacity(2048);
/// config.validate().expect("valid configuration");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Entry bound for each identity cache (classification lists, decision
    /// mailbox, attribution tables).
    pub cache_capacity: usize,

    /// Slot count of the auth channel.
    pub auth_channel_capacity: usize,

    /// Slot count of the notify channel.
    pub notify_channel_capacity: usize,

    /// How long an interception thread stays parked waiting for a verdict
    /// before failing open.
    pub decision_timeout: Duration,

    /// Maximum identities accepted per classification-list replace.
    pub max_list_len: usize,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
            auth_channel_capacity: 1024,
            notify_channel_capacity: 2048,
            decision_timeout: Duration::from_secs(30),
            max_list_len: 1024,
        }
    }
}

impl SensorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the identity-cache capacity.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the auth channel capacity.
    pub fn with_auth_channel_capacity(mut self, capacity: usize) -> Self {
        self.auth_channel_capacity = capacity;
        self
    }

    /// Sets the notify channel capacity.
    pub fn with_notify_channel_capacity(mut self, capacity: usize) -> Self {
        self.notify_channel_capacity = capacity;
        self
    }

    /// Sets the decision timeout.
    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }

    /// Sets the per-replace list length bound.
    pub fn with_max_list_len(mut self, max: usize) -> Self {
        self.max_list_len = max;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any capacity is zero or the decision timeout is
    /// outside the supported window.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache_capacity == 0 {
            anyhow::bail!("cache_capacity must be greater than 0");
        }
        if self.auth_channel_capacity == 0 {
            anyhow::bail!("auth_channel_capacity must be greater than 0");
        }
        if self.notify_channel_capacity == 0 {
            anyhow::bail!("notify_channel_capacity must be greater than 0");
        }
        if self.max_list_len == 0 {
            anyhow::bail!("max_list_len must be greater than 0");
        }
        if self.decision_timeout < MIN_DECISION_TIMEOUT || self.decision_timeout > MAX_DECISION_TIMEOUT
        {
            anyhow::bail!(
                "decision_timeout must be between {MIN_DECISION_TIMEOUT:?} and {MAX_DECISION_TIMEOUT:?}"
            );
        }

        if self.max_list_len > self.cache_capacity {
            tracing::warn!(
                max_list_len = self.max_list_len,
                cache_capacity = self.cache_capacity,
                "list replaces can overflow the cache and clear earlier entries"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        SensorConfig::default().validate().expect("default config");
    }

    #[test]
    fn test_zero_capacities_are_rejected() {
        assert!(SensorConfig::default()
            .with_cache_capacity(0)
            .validate()
            .is_err());
        assert!(SensorConfig::default()
            .with_auth_channel_capacity(0)
            .validate()
            .is_err());
        assert!(SensorConfig::default()
            .with_notify_channel_capacity(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_decision_timeout_window_is_enforced() {
        assert!(SensorConfig::default()
            .with_decision_timeout(Duration::from_millis(50))
            .validate()
            .is_err());
        assert!(SensorConfig::default()
            .with_decision_timeout(Duration::from_secs(120))
            .validate()
            .is_err());
        assert!(SensorConfig::default()
            .with_decision_timeout(Duration::from_millis(100))
            .validate()
            .is_ok());
    }
}
