use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reelforge_core::health::{
    HealthPolicy, DEFAULT_AGENT_MODE, DEFAULT_ERROR_THRESHOLD, DEFAULT_MAX_RELOGIN_ATTEMPTS,
    DEFAULT_MAX_RESTARTS, DEFAULT_MONITOR_INTERVAL, DEFAULT_RESTART_SETTLE,
};
use reelforge_db::JobStoreLayout;
use reelforge_pipeline::rewrite::{DEFAULT_REWRITE_MODEL, DEFAULT_REWRITE_URL};
use reelforge_pipeline::validator::{DEFAULT_ITEM_DELAY, DEFAULT_RETEST_DELAY};
use reelforge_pipeline::{RunnerConfig, ValidatorConfig};

/// Default lease lifetime: six hours.
const DEFAULT_LEASE_TTL_SECS: u64 = 6 * 60 * 60;

/// Invalid or missing configuration.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub master_dir: PathBuf,
    pub completed_dir: PathBuf,
    pub local_dir: PathBuf,
    pub source_dir: Option<PathBuf>,
    /// Lease owner identity.
    pub worker_name: String,
    /// Only claim codes of this channel.
    pub channel: Option<String>,
    pub agent_count: u32,
    /// Driver executable followed by its fixed arguments.
    pub driver_command: Vec<String>,
    pub agent_timeout: Duration,
    pub agent_mode: String,
    pub start_stagger: Duration,
    pub scan_interval: Duration,
    pub monitor_interval: Duration,
    pub max_restarts: u32,
    pub error_threshold: u32,
    pub restart_settle: Duration,
    pub max_relogin_attempts: u32,
    pub validate_references: bool,
    pub validate_item_delay: Duration,
    pub retest_delay: Duration,
    pub rewrite_url: String,
    /// Rewriting is disabled when unset.
    pub rewrite_api_key: Option<String>,
    pub rewrite_model: String,
    pub claim_leases: bool,
    pub lease_ttl: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                    | Default                                      |
    /// |----------------------------|----------------------------------------------|
    /// | `MASTER_PROJECTS_DIR`      | required                                     |
    /// | `MASTER_COMPLETED_DIR`     | required                                     |
    /// | `LOCAL_PROJECTS_DIR`       | `./PROJECTS`                                 |
    /// | `SOURCE_DIR`               | unset                                        |
    /// | `WORKER_NAME`              | `worker-<random>`                            |
    /// | `WORKER_CHANNEL`           | unset (all channels)                         |
    /// | `AGENT_COUNT`              | `2`                                          |
    /// | `AGENT_DRIVER_CMD`         | required                                     |
    /// | `AGENT_TIMEOUT_SECS`       | `600`                                        |
    /// | `AGENT_MODE`               | `image`                                      |
    /// | `AGENT_START_STAGGER_SECS` | `3`                                          |
    /// | `SCAN_INTERVAL_SECS`       | `30`                                         |
    /// | `MONITOR_INTERVAL_SECS`    | `30`                                         |
    /// | `MAX_RESTARTS`             | `5`                                          |
    /// | `ERROR_THRESHOLD`          | `3`                                          |
    /// | `RESTART_SETTLE_SECS`      | `2`                                          |
    /// | `MAX_RELOGIN_ATTEMPTS`     | `3`                                          |
    /// | `VALIDATE_REFERENCES`      | `true`                                       |
    /// | `VALIDATE_ITEM_DELAY_SECS` | `3`                                          |
    /// | `RETEST_DELAY_SECS`        | `2`                                          |
    /// | `REWRITE_API_URL`          | `https://api.deepseek.com/chat/completions`  |
    /// | `REWRITE_API_KEY`          | unset (rewriting disabled)                   |
    /// | `REWRITE_MODEL`            | `deepseek-chat`                              |
    /// | `CLAIM_LEASES`             | `true`                                       |
    /// | `LEASE_TTL_SECS`           | `21600`                                      |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let driver_command: Vec<String> = env
            .required("AGENT_DRIVER_CMD")?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if driver_command.is_empty() {
            return Err(ConfigError::Missing("AGENT_DRIVER_CMD"));
        }

        let agent_count: u32 = env.parse_or("AGENT_COUNT", 2)?;
        if agent_count == 0 {
            return Err(ConfigError::Invalid {
                var: "AGENT_COUNT",
                value: "0".into(),
                reason: "at least one agent is required".into(),
            });
        }

        Ok(Self {
            master_dir: env.required("MASTER_PROJECTS_DIR")?.into(),
            completed_dir: env.required("MASTER_COMPLETED_DIR")?.into(),
            local_dir: env
                .optional("LOCAL_PROJECTS_DIR")
                .unwrap_or_else(|| "./PROJECTS".into())
                .into(),
            source_dir: env.optional("SOURCE_DIR").map(PathBuf::from),
            worker_name: env.optional("WORKER_NAME").unwrap_or_else(default_worker_name),
            channel: env.optional("WORKER_CHANNEL"),
            agent_count,
            driver_command,
            agent_timeout: env.secs_or("AGENT_TIMEOUT_SECS", 600)?,
            agent_mode: env
                .optional("AGENT_MODE")
                .unwrap_or_else(|| DEFAULT_AGENT_MODE.into()),
            start_stagger: env.secs_or("AGENT_START_STAGGER_SECS", 3)?,
            scan_interval: env.secs_or("SCAN_INTERVAL_SECS", 30)?,
            monitor_interval: env
                .secs_or("MONITOR_INTERVAL_SECS", DEFAULT_MONITOR_INTERVAL.as_secs())?,
            max_restarts: env.parse_or("MAX_RESTARTS", DEFAULT_MAX_RESTARTS)?,
            error_threshold: env.parse_or("ERROR_THRESHOLD", DEFAULT_ERROR_THRESHOLD)?,
            restart_settle: env
                .secs_or("RESTART_SETTLE_SECS", DEFAULT_RESTART_SETTLE.as_secs())?,
            max_relogin_attempts: env
                .parse_or("MAX_RELOGIN_ATTEMPTS", DEFAULT_MAX_RELOGIN_ATTEMPTS)?,
            validate_references: env.bool_or("VALIDATE_REFERENCES", true)?,
            validate_item_delay: env
                .secs_or("VALIDATE_ITEM_DELAY_SECS", DEFAULT_ITEM_DELAY.as_secs())?,
            retest_delay: env.secs_or("RETEST_DELAY_SECS", DEFAULT_RETEST_DELAY.as_secs())?,
            rewrite_url: env
                .optional("REWRITE_API_URL")
                .unwrap_or_else(|| DEFAULT_REWRITE_URL.into()),
            rewrite_api_key: env.optional("REWRITE_API_KEY"),
            rewrite_model: env
                .optional("REWRITE_MODEL")
                .unwrap_or_else(|| DEFAULT_REWRITE_MODEL.into()),
            claim_leases: env.bool_or("CLAIM_LEASES", true)?,
            lease_ttl: env.secs_or("LEASE_TTL_SECS", DEFAULT_LEASE_TTL_SECS)?,
        })
    }

    pub fn layout(&self) -> JobStoreLayout {
        JobStoreLayout {
            master_dir: self.master_dir.clone(),
            completed_dir: self.completed_dir.clone(),
            local_dir: self.local_dir.clone(),
            source_dir: self.source_dir.clone(),
        }
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            max_restarts: self.max_restarts,
            error_threshold: self.error_threshold,
            restart_settle: self.restart_settle,
            mode: Some(self.agent_mode.clone()),
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            mode: Some(self.agent_mode.clone()),
            start_stagger: self.start_stagger,
            max_relogin_attempts: self.max_relogin_attempts,
            relogin_settle: self.restart_settle,
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            item_delay: self.validate_item_delay,
            retest_delay: self.retest_delay,
        }
    }
}

fn default_worker_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

// ---------------------------------------------------------------------------
// Lookup helpers
// ---------------------------------------------------------------------------

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank.
    fn optional(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn parse_or<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn secs_or(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse_or(var, default).map(Duration::from_secs)
    }

    fn bool_or(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(var) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: "expected true or false".into(),
                }),
            },
        }
    }
}
