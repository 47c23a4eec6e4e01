use std::time::Duration;

use cadence_resilience::{CircuitBreakerConfig, RetryConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600; // 1 hour: retraining jobs are slow

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryPresets,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// What the tick loop does when a job is due while its previous run is still going.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Dispatch anyway; two executions of the same job may run side by side.
    #[default]
    Allow,
    /// Keep the claim for the minute but do not dispatch.
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between heartbeat events while the daemon blocks.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            overlap: OverlapPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

/// Named retry presets. Both run the same algorithm with different tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPresets {
    #[serde(default = "RetryConfig::network")]
    pub network: RetryConfig,
    #[serde(default = "RetryConfig::download")]
    pub download: RetryConfig,
}

impl Default for RetryPresets {
    fn default() -> Self {
        Self {
            network: RetryConfig::network(),
            download: RetryConfig::download(),
        }
    }
}

/// Circuit breaker settings applied to every protected host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout_secs: DEFAULT_RECOVERY_TIMEOUT_SECS,
        }
    }
}

impl BreakerConfig {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }
}

/// A job declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Label used in logs and events.
    pub name: String,
    /// 5-field cron expression, evaluated in UTC.
    pub schedule: String,
    #[serde(flatten)]
    pub kind: JobKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Run a shell command via `sh -c`. A non-zero exit status is a failure.
    Command {
        command: String,
        /// Wrap the command in the download retry preset.
        #[serde(default)]
        retry: bool,
        #[serde(default = "default_command_timeout_secs")]
        timeout_secs: u64,
    },
    /// GET a URL through the network retry preset and the host's circuit breaker.
    Http { url: String },
}

fn default_heartbeat_secs() -> u64 {
    DEFAULT_HEARTBEAT_SECS
}
fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}
fn default_recovery_timeout_secs() -> u64 {
    DEFAULT_RECOVERY_TIMEOUT_SECS
}
fn default_command_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Built-in defaults sit underneath both layers, so a partial
    /// `[retry.network]` table only overrides the keys it names. Nested env
    /// keys use a double underscore: `CADENCE_SCHEDULER__HEARTBEAT_SECS=30`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(CadenceConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("CADENCE_").ignore(&["config"]).split("__"))
    }
}

pub fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_resilience::ErrorKind;

    #[test]
    fn missing_file_yields_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = CadenceConfig::load(Some("does-not-exist.toml")).unwrap();
            assert_eq!(config.scheduler.heartbeat_secs, DEFAULT_HEARTBEAT_SECS);
            assert_eq!(config.scheduler.overlap, OverlapPolicy::Allow);
            assert_eq!(config.breaker.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
            assert!(config.jobs.is_empty());
            Ok(())
        });
    }

    #[test]
    fn partial_retry_table_keeps_preset_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [retry.network]
                max_attempts = 9
                "#,
            )?;
            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            let preset = RetryConfig::network();
            assert_eq!(config.retry.network.max_attempts, 9);
            assert_eq!(config.retry.network.initial_delay, preset.initial_delay);
            assert_eq!(config.retry.network.multiplier, preset.multiplier);
            assert!(config
                .retry
                .download
                .retryable_kinds
                .contains(&ErrorKind::Interrupted));
            Ok(())
        });
    }

    #[test]
    fn jobs_parse_by_kind() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [scheduler]
                overlap = "skip"

                [[jobs]]
                name = "refresh-data"
                schedule = "0 */6 * * *"
                kind = "command"
                command = "python refresh.py"
                retry = true

                [[jobs]]
                name = "submit"
                schedule = "0 18 * * 6"
                kind = "http"
                url = "https://example.com/submit"
                "#,
            )?;
            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.scheduler.overlap, OverlapPolicy::Skip);
            assert_eq!(config.jobs.len(), 2);
            match &config.jobs[0].kind {
                JobKind::Command {
                    command,
                    retry,
                    timeout_secs,
                } => {
                    assert_eq!(command, "python refresh.py");
                    assert!(*retry);
                    assert_eq!(*timeout_secs, DEFAULT_COMMAND_TIMEOUT_SECS);
                }
                other => panic!("expected command job, got {other:?}"),
            }
            assert!(matches!(config.jobs[1].kind, JobKind::Http { .. }));
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("cadence.toml", "[scheduler]\nheartbeat_secs = 10\n")?;
            jail.set_env("CADENCE_SCHEDULER__HEARTBEAT_SECS", "45");
            jail.set_env("CADENCE_BREAKER__FAILURE_THRESHOLD", "2");
            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.scheduler.heartbeat_secs, 45);
            assert_eq!(config.breaker.failure_threshold, 2);
            Ok(())
        });
    }

    #[test]
    fn unknown_job_kind_is_a_config_error() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [[jobs]]
                name = "x"
                schedule = "* * * * *"
                kind = "carrier-pigeon"
                "#,
            )?;
            let err = CadenceConfig::load(Some("cadence.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }
}
