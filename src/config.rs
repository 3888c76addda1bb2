//! Measurement settings.
//!
//! Built once at startup (from defaults, a JSON document or the environment)
//! and handed to the orchestrator by reference.

use crate::state::DEFAULT_STATE_PREFIX;
use anyhow::{Context, Result};
use serde_derive::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeasureConfig {
    /// Number of cold starts to collect per build.
    pub cold_start_samples: usize,
    /// Number of warm invocations chained after each cold start.
    pub warm_start_samples: usize,
    pub max_consecutive_failures: u32,
    pub conflict_backoff_secs: u64,
    pub poll_interval_secs: u64,
    /// Polls before a function stuck in `Pending` is given up on.
    pub max_ready_polls: u32,
    /// Pause after measuring so the provider can flush logs.
    pub settle_delay_secs: u64,
    /// Hard execution limit of one orchestrator invocation.
    pub execution_limit_secs: u64,
    /// Stop starting new attempts this long before the execution limit.
    pub safety_margin_secs: u64,
    /// How long the caller should back off after a rate-limited run.
    pub rate_limit_cooldown_secs: u64,
    pub state_prefix: String,
    pub redis_url: String,
    pub region: String,
    pub listen_port: u16,
    /// Keep state in this directory instead of redis.
    pub state_dir: Option<String>,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            cold_start_samples: 100,
            warm_start_samples: 10,
            max_consecutive_failures: 10,
            conflict_backoff_secs: 2,
            poll_interval_secs: 1,
            max_ready_polls: 30,
            settle_delay_secs: 5,
            execution_limit_secs: 900,
            safety_margin_secs: 60,
            rate_limit_cooldown_secs: 300,
            state_prefix: DEFAULT_STATE_PREFIX.to_string(),
            redis_url: "redis://127.0.0.1/".to_string(),
            region: "us-east-1".to_string(),
            listen_port: 8888,
            state_dir: None,
        }
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {value:?}")),
        Err(_) => Ok(default),
    }
}

impl MeasureConfig {
    /// Defaults overridden by `COLD_START_SAMPLES`, `WARM_START_SAMPLES`, ...
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            cold_start_samples: env_or("COLD_START_SAMPLES", defaults.cold_start_samples)?,
            warm_start_samples: env_or("WARM_START_SAMPLES", defaults.warm_start_samples)?,
            max_consecutive_failures: env_or(
                "MAX_CONSECUTIVE_FAILURES",
                defaults.max_consecutive_failures,
            )?,
            conflict_backoff_secs: env_or("CONFLICT_BACKOFF_SECS", defaults.conflict_backoff_secs)?,
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", defaults.poll_interval_secs)?,
            max_ready_polls: env_or("MAX_READY_POLLS", defaults.max_ready_polls)?,
            settle_delay_secs: env_or("SETTLE_DELAY_SECS", defaults.settle_delay_secs)?,
            execution_limit_secs: env_or("EXECUTION_LIMIT_SECS", defaults.execution_limit_secs)?,
            safety_margin_secs: env_or("SAFETY_MARGIN_SECS", defaults.safety_margin_secs)?,
            rate_limit_cooldown_secs: env_or(
                "RATE_LIMIT_COOLDOWN_SECS",
                defaults.rate_limit_cooldown_secs,
            )?,
            state_prefix: env_or("STATE_PREFIX", defaults.state_prefix)?,
            redis_url: env_or("REDIS_URL", defaults.redis_url)?,
            region: env_or("AWS_REGION", defaults.region)?,
            listen_port: env_or("LISTEN_PORT", defaults.listen_port)?,
            state_dir: std::env::var("STATE_DIR")
                .ok()
                .filter(|dir| !dir.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// The driver only checks for cancellation between attempts, so the
    /// longest wait of a single attempt has to fit inside the safety margin.
    pub fn validate(&self) -> Result<()> {
        let longest_wait = self.longest_attempt_wait();
        if longest_wait >= Duration::from_secs(self.safety_margin_secs) {
            anyhow::bail!(
                "ready polling ({} x {}s) plus conflict backoff ({}s) must stay below the \
                 {}s safety margin",
                self.max_ready_polls,
                self.poll_interval_secs,
                self.conflict_backoff_secs,
                self.safety_margin_secs
            );
        }
        if self.safety_margin_secs >= self.execution_limit_secs {
            anyhow::bail!(
                "safety margin ({}s) must be below the execution limit ({}s)",
                self.safety_margin_secs,
                self.execution_limit_secs
            );
        }
        Ok(())
    }

    /// Upper bound of the time one attempt spends waiting on the provider.
    pub fn longest_attempt_wait(&self) -> Duration {
        self.poll_interval() * self.max_ready_polls + self.conflict_backoff()
    }

    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_secs(self.conflict_backoff_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    /// Time budget for starting attempts within one invocation.
    pub fn measurement_budget(&self) -> Duration {
        Duration::from_secs(
            self.execution_limit_secs
                .saturating_sub(self.safety_margin_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_leaves_safety_margin() {
        let config = MeasureConfig::default();
        assert_eq!(config.measurement_budget(), Duration::from_secs(840));

        let tight = MeasureConfig {
            execution_limit_secs: 30,
            ..Default::default()
        };
        assert_eq!(tight.measurement_budget(), Duration::ZERO);
    }

    #[test]
    fn defaults_fit_the_safety_margin() {
        let config = MeasureConfig::default();
        assert_eq!(config.longest_attempt_wait(), Duration::from_secs(32));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_polling_longer_than_the_safety_margin() {
        let slow = MeasureConfig {
            max_ready_polls: 600,
            ..Default::default()
        };
        assert!(slow.validate().is_err());

        let edge = MeasureConfig {
            max_ready_polls: 58,
            ..Default::default()
        };
        assert!(edge.validate().is_err());

        let no_budget = MeasureConfig {
            execution_limit_secs: 60,
            ..Default::default()
        };
        assert!(no_budget.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: MeasureConfig =
            serde_json::from_str(r#"{"coldStartSamples": 3, "warmStartSamples": 2}"#).unwrap();
        assert_eq!(config.cold_start_samples, 3);
        assert_eq!(config.warm_start_samples, 2);
        assert_eq!(config.max_consecutive_failures, 10);
        assert_eq!(config.state_prefix, "measurements");
    }

    #[test]
    fn state_dir_comes_from_env() {
        std::env::set_var("STATE_DIR", "/tmp/coldstart-state");
        let config = MeasureConfig::from_env();
        std::env::remove_var("STATE_DIR");
        assert_eq!(
            config.unwrap().state_dir.as_deref(),
            Some("/tmp/coldstart-state")
        );
    }

    #[test]
    fn env_value_must_parse() {
        std::env::set_var("COLDSTART_TEST_BOGUS_NUMBER", "ten");
        assert!(env_or("COLDSTART_TEST_BOGUS_NUMBER", 1usize).is_err());
        assert_eq!(env_or("COLDSTART_TEST_UNSET_NUMBER", 7usize).unwrap(), 7);
    }
}
