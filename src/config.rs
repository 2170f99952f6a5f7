//! Engine configuration loaded from `checkflow.toml`.
//!
//! [`EngineConfig`] holds every tunable. Missing values fall back to defaults, and
//! `CHECKFLOW_WEBHOOK_URL` takes precedence over the file's `webhook_url`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::state_machine::{Phase, RetryConfig};

const DEFAULT_PATH: &str = "checkflow.toml";

/// Per-run budgets handed to every root job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Stall budget in seconds.
    pub task_timeout: i64,
    /// Fan-in and grace budget in seconds.
    pub wait_timeout: i64,
    pub max_retries: u32,
    /// Seconds between two scheduled runs of a checklist.
    pub run_period: i64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            task_timeout: default_task_timeout(),
            wait_timeout: default_wait_timeout(),
            max_retries: default_max_retries(),
            run_period: default_run_period(),
        }
    }
}

/// Optional per-organization overrides of [`RunSettings`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OrganizationOverrides {
    pub task_timeout_secs: Option<i64>,
    pub wait_timeout_secs: Option<i64>,
    pub max_retries: Option<u32>,
    pub run_period_secs: Option<i64>,
}

/// Module names fanned out for each phase.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModuleLists {
    #[serde(default)]
    pub recommendation: Vec<String>,
    #[serde(default)]
    pub archive: Vec<String>,
    #[serde(default)]
    pub service: Vec<String>,
}

impl ModuleLists {
    pub fn for_phase(&self, phase: Phase) -> &[String] {
        match phase {
            Phase::Recommendation => &self.recommendation,
            Phase::Archive => &self.archive,
            Phase::Service => &self.service,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: i64,

    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: i64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_run_period")]
    pub run_period_secs: i64,

    /// How long a checklist may stay mid-run before the scheduler reclaims it.
    #[serde(default = "default_reschedule_timeout")]
    pub reschedule_timeout_secs: i64,

    /// Redelivery delay for a wait step whose barrier is still closed.
    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,

    /// Base delay for republishing after a transient step failure.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Attempts for a single queue publish.
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,

    /// Deliveries processed concurrently by one worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default)]
    pub modules: ModuleLists,

    #[serde(default)]
    pub organizations: HashMap<String, OrganizationOverrides>,
}

fn default_task_timeout() -> i64 {
    3_600
}

fn default_wait_timeout() -> i64 {
    7_200
}

fn default_max_retries() -> u32 {
    3
}

fn default_run_period() -> i64 {
    86_400
}

fn default_reschedule_timeout() -> i64 {
    86_400
}

fn default_poll_delay_ms() -> u64 {
    5_000
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_publish_retries() -> u32 {
    3
}

fn default_concurrency() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout(),
            wait_timeout_secs: default_wait_timeout(),
            max_retries: default_max_retries(),
            run_period_secs: default_run_period(),
            reschedule_timeout_secs: default_reschedule_timeout(),
            poll_delay_ms: default_poll_delay_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            publish_retries: default_publish_retries(),
            concurrency: default_concurrency(),
            webhook_url: None,
            modules: ModuleLists::default(),
            organizations: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Loads `path`, or `checkflow.toml` in the current directory. Uses defaults if
    /// the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_PATH));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<EngineConfig>(&contents)?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var("CHECKFLOW_WEBHOOK_URL")
            && !url.is_empty()
        {
            config.webhook_url = Some(url);
        }

        Ok(config)
    }

    /// Settings for organizations without overrides.
    pub fn default_run_settings(&self) -> RunSettings {
        RunSettings {
            task_timeout: self.task_timeout_secs,
            wait_timeout: self.wait_timeout_secs,
            max_retries: self.max_retries,
            run_period: self.run_period_secs,
        }
    }

    pub fn run_settings_for(&self, organization_id: &str) -> RunSettings {
        let base = self.default_run_settings();
        match self.organizations.get(organization_id) {
            Some(o) => RunSettings {
                task_timeout: o.task_timeout_secs.unwrap_or(base.task_timeout),
                wait_timeout: o.wait_timeout_secs.unwrap_or(base.wait_timeout),
                max_retries: o.max_retries.unwrap_or(base.max_retries),
                run_period: o.run_period_secs.unwrap_or(base.run_period),
            },
            None => base,
        }
    }

    /// Backoff used when a step fails transiently.
    pub fn step_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.retry_base_delay_ms,
        }
    }

    /// Backoff used when the queue rejects a publish.
    pub fn publish_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.publish_retries,
            base_delay_ms: self.retry_base_delay_ms,
        }
    }
}

/// Supplies run budgets per organization.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn run_settings(&self, organization_id: &str) -> Result<RunSettings, EngineError>;
}

#[async_trait]
impl SettingsSource for EngineConfig {
    async fn run_settings(&self, organization_id: &str) -> Result<RunSettings, EngineError> {
        Ok(self.run_settings_for(organization_id))
    }
}
