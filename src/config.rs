//! fanout configuration loaded from `fanout.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! `FANOUT_ENDPOINT` takes precedence over the file; command-line flags are
//! applied on top by the binary.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::health::HealthConfig;
use crate::item::{ExecutionMode, JobConfig, RetryPolicy};
use crate::normalize::NormalizeOptions;
use crate::rate_limit::RateLimit;

pub const DEFAULT_CONFIG_FILE: &str = "fanout.toml";
pub const ENDPOINT_ENV: &str = "FANOUT_ENDPOINT";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Query endpoint every item is sent to.
    #[serde(default)]
    pub endpoint: String,

    /// Form field carrying string payloads.
    #[serde(default = "default_query_param")]
    pub query_param: String,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Process items one at a time, in input order.
    #[serde(default)]
    pub sequential: bool,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_true")]
    pub continue_on_error: bool,

    #[serde(default = "default_true")]
    pub deduplicate: bool,

    /// Checkpoint every N finished items; 0 turns checkpointing off.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,

    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    #[serde(default)]
    pub rate_limit: Option<RateLimit>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub input: InputConfig,
}

/// Field names used when reading structured and tabular input.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub id_field: String,
    pub payload_field: String,
    pub metadata_field: String,
    pub comment_prefix: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        let defaults = NormalizeOptions::default();
        Self {
            id_field: defaults.id_field,
            payload_field: defaults.payload_field,
            metadata_field: defaults.metadata_field,
            comment_prefix: defaults.comment_prefix,
        }
    }
}

fn default_query_param() -> String {
    "query".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("fanout-out")
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_interval() -> usize {
    10
}

fn default_item_timeout_secs() -> u64 {
    60
}

fn default_cancel_grace_secs() -> u64 {
    5
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            query_param: default_query_param(),
            output_dir: default_output_dir(),
            concurrency: default_concurrency(),
            sequential: false,
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            continue_on_error: true,
            deduplicate: true,
            checkpoint_interval: default_checkpoint_interval(),
            item_timeout_secs: default_item_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            rate_limit: None,
            health: HealthConfig::default(),
            input: InputConfig::default(),
        }
    }
}

impl FanoutConfig {
    /// Load `path`, or `fanout.toml` in the working directory when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };

        let mut config = if path.exists() || required {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            toml::from_str::<FanoutConfig>(&contents)
                .with_context(|| format!("invalid config {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup(ENDPOINT_ENV)
            && !endpoint.is_empty()
        {
            self.endpoint = endpoint;
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(crate::output::CHECKPOINT_FILE)
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            id_field: self.input.id_field.clone(),
            payload_field: self.input.payload_field.clone(),
            metadata_field: self.input.metadata_field.clone(),
            comment_prefix: self.input.comment_prefix.clone(),
        }
    }

    /// Job settings for a run against `self.endpoint`.
    pub fn job_config(&self) -> JobConfig {
        let destination = if self.endpoint.is_empty() {
            JobConfig::default().destination
        } else {
            self.endpoint.clone()
        };
        JobConfig {
            destination,
            concurrency: self.concurrency,
            mode: if self.sequential {
                ExecutionMode::Sequential
            } else {
                ExecutionMode::Parallel
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay_ms: self.base_delay_ms,
                multiplier: self.backoff_multiplier,
                max_delay_ms: self.max_delay_ms,
            },
            continue_on_error: self.continue_on_error,
            rate_limit: self.rate_limit.clone(),
            deduplicate: self.deduplicate,
            checkpoint_interval_items: self.checkpoint_interval,
            item_timeout: Duration::from_secs(self.item_timeout_secs),
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
        }
    }
}
