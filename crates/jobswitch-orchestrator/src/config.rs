use crate::broker::CacheConfig;
use crate::retry::{RetryConfig, TaskRetryConfig};
use jobswitch_core::{JobSwitchError, JobSwitchResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Orchestrator tuning, loadable from TOML. Durations are in seconds.
///
/// ```toml
/// max_concurrent_tasks = 10
/// dispatch_interval = 1.0
///
/// [registration_retry]
/// max_attempts = 3
/// base_delay = 2.0
///
/// [cache]
/// enabled = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Tasks allowed to run at once across all agents.
    pub max_concurrent_tasks: usize,
    /// Pending tasks accepted before `submit_task` refuses more.
    pub max_queue_size: usize,
    /// Concurrent tasks a single agent may run.
    pub default_max_load: u32,
    /// Fallback poll period of the dispatch loop.
    pub dispatch_interval: f64,
    pub health_check_interval: f64,
    /// How long an agent gets to answer `get_status` during a health check.
    pub health_check_timeout: f64,
    pub cleanup_interval: f64,
    /// How long finished tasks are kept before cleanup purges them.
    pub task_retention: f64,
    /// How long `register_agent` waits for the orchestrator to become ready.
    pub registration_ready_timeout: f64,
    /// Upper bound on a locally executed `coordinate_agents` run.
    pub workflow_timeout: f64,
    pub registration_retry: RetryConfig,
    pub task_retry: TaskRetryConfig,
    pub cache: CacheConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_queue_size: 1000,
            default_max_load: 10,
            dispatch_interval: 1.0,
            health_check_interval: 30.0,
            health_check_timeout: 5.0,
            cleanup_interval: 3600.0,
            task_retention: 24.0 * 3600.0,
            registration_ready_timeout: 30.0,
            workflow_timeout: 600.0,
            registration_retry: RetryConfig::registration(),
            task_retry: TaskRetryConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Longest retention window accepted for finished tasks, in seconds.
pub const MAX_TASK_RETENTION_SECS: f64 = 365.0 * 24.0 * 3600.0;

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(raw: &str) -> JobSwitchResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| JobSwitchError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> JobSwitchResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw).map_err(|e| match e {
            JobSwitchError::Config(msg) => {
                JobSwitchError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn to_toml_string(&self) -> JobSwitchResult<String> {
        toml::to_string_pretty(self).map_err(|e| JobSwitchError::Config(e.to_string()))
    }

    /// Reject settings that would stall the orchestrator.
    pub fn validate(&self) -> JobSwitchResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(JobSwitchError::Config("max_concurrent_tasks must be at least 1".into()));
        }
        if self.max_queue_size == 0 {
            return Err(JobSwitchError::Config("max_queue_size must be at least 1".into()));
        }
        if self.default_max_load == 0 {
            return Err(JobSwitchError::Config("default_max_load must be at least 1".into()));
        }
        for (name, value) in [
            ("dispatch_interval", self.dispatch_interval),
            ("health_check_interval", self.health_check_interval),
            ("cleanup_interval", self.cleanup_interval),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(JobSwitchError::Config(format!("{name} must be positive, got {value}")));
            }
        }
        for (name, value) in [
            ("health_check_timeout", self.health_check_timeout),
            ("registration_ready_timeout", self.registration_ready_timeout),
            ("workflow_timeout", self.workflow_timeout),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(JobSwitchError::Config(format!(
                    "{name} must be a finite number of seconds, got {value}"
                )));
            }
        }
        if !(self.task_retention.is_finite()
            && (0.0..=MAX_TASK_RETENTION_SECS).contains(&self.task_retention))
        {
            return Err(JobSwitchError::Config(format!(
                "task_retention must be between 0 and {MAX_TASK_RETENTION_SECS} seconds, got {}",
                self.task_retention
            )));
        }
        self.registration_retry.validate("registration_retry")?;
        self.task_retry.validate("task_retry")?;
        Ok(())
    }

    pub fn dispatch_interval(&self) -> Duration {
        secs(self.dispatch_interval)
    }

    pub fn health_check_interval(&self) -> Duration {
        secs(self.health_check_interval)
    }

    pub fn health_check_timeout(&self) -> Duration {
        secs(self.health_check_timeout)
    }

    pub fn cleanup_interval(&self) -> Duration {
        secs(self.cleanup_interval)
    }

    pub fn task_retention(&self) -> Duration {
        secs(self.task_retention)
    }

    pub fn registration_ready_timeout(&self) -> Duration {
        secs(self.registration_ready_timeout)
    }

    pub fn workflow_timeout(&self) -> Duration {
        secs(self.workflow_timeout)
    }
}
