//! Configuration for the maintenance scheduler

use crate::error::{Result, TollgateError};
use crate::utils::{get_env_flag, get_env_parsed};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Intervals for the periodic maintenance sweeps
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobsConfig {
    /// Run the maintenance sweeps in this process
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Audit log retention sweep interval
    #[serde(default = "default_audit_sweep_seconds")]
    pub audit_sweep_seconds: u64,

    /// Webhook dedup record cleanup interval
    #[serde(default = "default_webhook_sweep_seconds")]
    pub webhook_sweep_seconds: u64,

    /// Verification token cleanup interval
    #[serde(default = "default_token_sweep_seconds")]
    pub token_sweep_seconds: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            audit_sweep_seconds: default_audit_sweep_seconds(),
            webhook_sweep_seconds: default_webhook_sweep_seconds(),
            token_sweep_seconds: default_token_sweep_seconds(),
        }
    }
}

impl JobsConfig {
    /// Load jobs configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(enabled) = get_env_flag("JOBS_ENABLED") {
            config.enabled = enabled;
        }
        if let Some(secs) = get_env_parsed("JOBS_AUDIT_SWEEP_SECONDS") {
            config.audit_sweep_seconds = secs;
        }
        if let Some(secs) = get_env_parsed("JOBS_WEBHOOK_SWEEP_SECONDS") {
            config.webhook_sweep_seconds = secs;
        }
        if let Some(secs) = get_env_parsed("JOBS_TOKEN_SWEEP_SECONDS") {
            config.token_sweep_seconds = secs;
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("JOBS_AUDIT_SWEEP_SECONDS", self.audit_sweep_seconds),
            ("JOBS_WEBHOOK_SWEEP_SECONDS", self.webhook_sweep_seconds),
            ("JOBS_TOKEN_SWEEP_SECONDS", self.token_sweep_seconds),
        ] {
            if secs == 0 {
                return Err(TollgateError::bad_request(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_sweep_seconds)
    }

    pub fn webhook_interval(&self) -> Duration {
        Duration::from_secs(self.webhook_sweep_seconds)
    }

    pub fn token_interval(&self) -> Duration {
        Duration::from_secs(self.token_sweep_seconds)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_audit_sweep_seconds() -> u64 {
    6 * 60 * 60
}

fn default_webhook_sweep_seconds() -> u64 {
    60 * 60
}

fn default_token_sweep_seconds() -> u64 {
    24 * 60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_intervals() {
        let config = JobsConfig::default();
        assert!(config.enabled);
        assert_eq!(config.audit_interval(), Duration::from_secs(21600));
        assert_eq!(config.webhook_interval(), Duration::from_secs(3600));
        assert_eq!(config.token_interval(), Duration::from_secs(86400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = JobsConfig {
            webhook_sweep_seconds: 0,
            ..JobsConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("JOBS_WEBHOOK_SWEEP_SECONDS"));
    }
}
