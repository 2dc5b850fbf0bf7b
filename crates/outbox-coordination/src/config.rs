//! Runtime configuration of one agent.
//!
//! Built from the layered [`Settings`] and validated once before an agent
//! starts. Durations are converted from the millisecond settings here so
//! the loops never see raw integers.

use std::time::Duration;

use outbox_storage::keys::validate_tenant;
use outbox_storage::RetryPolicy;
use outbox_types::{AssignmentStrategy, CoordinationSettings, Settings};

use crate::error::CoordinationError;

/// Configuration consumed by [`crate::OutboxAgent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationConfig {
    pub tenant_id: String,
    pub agent_name: String,
    pub pulse_interval: Duration,
    pub lease_duration: Duration,
    pub monitor_interval: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub total_shard_count: u32,
    pub poll_backoff_min: Duration,
    pub poll_backoff_max: Duration,
    pub poll_jitter: Duration,
    pub expired_agent_grace: Duration,
    pub pulse_max_attempts: u32,
    pub worker_name_prefix: String,
    pub assignment_strategy: AssignmentStrategy,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self::from_parts("default", "outbox-agent", &CoordinationSettings::default())
    }
}

impl CoordinationConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::from_parts(
            &settings.tenant_id,
            &settings.agent_name,
            &settings.coordination,
        )
    }

    fn from_parts(tenant_id: &str, agent_name: &str, c: &CoordinationSettings) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            agent_name: agent_name.to_string(),
            pulse_interval: Duration::from_millis(c.pulse_interval_ms),
            lease_duration: Duration::from_millis(c.lease_duration_ms),
            monitor_interval: Duration::from_millis(c.monitor_interval_ms),
            batch_size: c.batch_size,
            max_retries: c.max_retries,
            retry_delay: Duration::from_millis(c.retry_delay_ms),
            total_shard_count: c.total_shard_count,
            poll_backoff_min: Duration::from_millis(c.poll_backoff_min_ms),
            poll_backoff_max: Duration::from_millis(c.poll_backoff_max_ms),
            poll_jitter: Duration::from_millis(c.poll_jitter_ms),
            expired_agent_grace: Duration::from_millis(c.expired_agent_grace_ms),
            pulse_max_attempts: c.pulse_max_attempts,
            worker_name_prefix: c.worker_name_prefix.clone(),
            assignment_strategy: c.assignment_strategy,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = name.into();
        self
    }

    /// Set pulse interval and lease duration together.
    pub fn with_lease(mut self, pulse_interval: Duration, lease_duration: Duration) -> Self {
        self.pulse_interval = pulse_interval;
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_total_shard_count(mut self, total: u32) -> Self {
        self.total_shard_count = total;
        self
    }

    pub fn with_poll_backoff(mut self, min: Duration, max: Duration, jitter: Duration) -> Self {
        self.poll_backoff_min = min;
        self.poll_backoff_max = max;
        self.poll_jitter = jitter;
        self
    }

    pub fn with_expired_agent_grace(mut self, grace: Duration) -> Self {
        self.expired_agent_grace = grace;
        self
    }

    pub fn with_assignment_strategy(mut self, strategy: AssignmentStrategy) -> Self {
        self.assignment_strategy = strategy;
        self
    }

    /// Reject configurations the loops cannot run with.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        validate_tenant(&self.tenant_id)
            .map_err(|e| CoordinationError::InvalidConfig(e.to_string()))?;

        if self.pulse_interval.is_zero() {
            return Err(invalid("pulse_interval must be > 0"));
        }
        if self.lease_duration <= self.pulse_interval {
            return Err(invalid(format!(
                "lease_duration ({:?}) must exceed pulse_interval ({:?})",
                self.lease_duration, self.pulse_interval
            )));
        }
        if self.monitor_interval.is_zero() {
            return Err(invalid("monitor_interval must be > 0"));
        }
        if self.total_shard_count == 0 {
            return Err(invalid("total_shard_count must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be > 0"));
        }
        if self.max_retries == 0 {
            return Err(invalid("max_retries must be > 0"));
        }
        if self.poll_backoff_min > self.poll_backoff_max {
            return Err(invalid(format!(
                "poll_backoff_min ({:?}) exceeds poll_backoff_max ({:?})",
                self.poll_backoff_min, self.poll_backoff_max
            )));
        }
        if self.pulse_max_attempts == 0 {
            return Err(invalid("pulse_max_attempts must be > 0"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay)
    }

    /// Lease length as a calendar duration for row timestamps.
    pub fn lease(&self) -> chrono::Duration {
        to_chrono(self.lease_duration)
    }

    pub fn grace(&self) -> chrono::Duration {
        to_chrono(self.expired_agent_grace)
    }

    /// Name of one of the agent's tasks, e.g. `outbox-01J..-poller`.
    pub fn task_name(&self, agent_id: &impl std::fmt::Display, task: &str) -> String {
        format!("{}-{}-{}", self.worker_name_prefix, agent_id, task)
    }
}

fn invalid(msg: impl Into<String>) -> CoordinationError {
    CoordinationError::InvalidConfig(msg.into())
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_default_settings() {
        let config = CoordinationConfig::from_settings(&Settings::default());
        assert_eq!(config.tenant_id, "default");
        assert_eq!(config.pulse_interval, Duration::from_secs(2));
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.total_shard_count, 8);
        assert_eq!(config.retry_policy(), RetryPolicy::new(3, Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_short_lease() {
        let config = CoordinationConfig::default()
            .with_lease(Duration::from_secs(5), Duration::from_secs(5));
        assert!(matches!(
            config.validate(),
            Err(CoordinationError::InvalidConfig(msg)) if msg.contains("lease_duration")
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = vec![
            CoordinationConfig::default().with_total_shard_count(0),
            CoordinationConfig::default().with_batch_size(0),
            CoordinationConfig::default().with_retries(0, Duration::ZERO),
            CoordinationConfig::default().with_tenant(""),
            CoordinationConfig::default().with_tenant("a:b"),
            CoordinationConfig::default().with_poll_backoff(
                Duration::from_secs(2),
                Duration::from_secs(1),
                Duration::ZERO,
            ),
        ];
        for config in cases {
            assert!(config.validate().is_err(), "accepted {:?}", config);
        }
    }

    #[test]
    fn test_task_name_uses_prefix() {
        let config = CoordinationConfig::default();
        assert_eq!(config.task_name(&"abc", "pulse"), "outbox-abc-pulse");
    }

    #[test]
    fn test_lease_conversion() {
        let config = CoordinationConfig::default()
            .with_lease(Duration::from_millis(100), Duration::from_millis(1_500));
        assert_eq!(config.lease(), chrono::Duration::milliseconds(1_500));
    }
}
