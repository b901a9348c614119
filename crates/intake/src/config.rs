//! Coordinator configuration.
//!
//! Every operational parameter lives here, loaded from a JSON file with
//! serde defaults; none of them changes the core algorithms. The
//! namespace value computes physical table names at startup (§ database
//! module) so several logical environments can share one deployment.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Operational parameters for the background processing coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Environment namespace prefixed onto physical table names.
    /// Empty means bare names.
    #[serde(default)]
    pub namespace: String,

    /// Minutes a claim may stay in-flight before the sweep force-fails it.
    #[serde(default = "default_stale_lock_minutes")]
    pub stale_lock_timeout_minutes: u64,

    /// Attempts when claiming a specific item under contention.
    #[serde(default = "default_claim_attempts")]
    pub claim_max_attempts: u32,

    /// Base backoff between claim attempts; doubles per attempt.
    #[serde(default = "default_claim_backoff_ms")]
    pub claim_backoff_ms: u64,

    /// Rows deleted per reconciliation batch.
    #[serde(default = "default_reconcile_batch")]
    pub reconcile_batch_size: u64,

    /// Pause between reconciliation batches, to limit store contention.
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,

    /// Seconds a finished rebuild job stays visible before cleanup.
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    /// Rows hashed per backfill batch.
    #[serde(default = "default_backfill_batch")]
    pub hash_backfill_batch_size: u64,

    /// Seconds between claim-cycle ticks on each worker.
    #[serde(default = "default_worker_poll_secs")]
    pub worker_poll_secs: u64,

    /// Seconds between stale-lock sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_stale_lock_minutes() -> u64 {
    60
}

fn default_claim_attempts() -> u32 {
    3
}

fn default_claim_backoff_ms() -> u64 {
    100
}

fn default_reconcile_batch() -> u64 {
    10_000
}

fn default_batch_pause_ms() -> u64 {
    50
}

fn default_job_retention_secs() -> u64 {
    300
}

fn default_backfill_batch() -> u64 {
    50_000
}

fn default_worker_poll_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    600
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            stale_lock_timeout_minutes: default_stale_lock_minutes(),
            claim_max_attempts: default_claim_attempts(),
            claim_backoff_ms: default_claim_backoff_ms(),
            reconcile_batch_size: default_reconcile_batch(),
            batch_pause_ms: default_batch_pause_ms(),
            job_retention_secs: default_job_retention_secs(),
            hash_backfill_batch_size: default_backfill_batch(),
            worker_poll_secs: default_worker_poll_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CoordinatorConfig {
    pub fn stale_lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_lock_timeout_minutes as i64)
    }

    /// Backoff before retry `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn claim_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.claim_backoff_ms << attempt.saturating_sub(1).min(16))
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker_poll_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CoordinatorConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<CoordinatorConfig, ConfigError> {
    let config: CoordinatorConfig = serde_json::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &CoordinatorConfig) -> Result<(), ConfigError> {
    if !config
        .namespace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ConfigError::Validation {
            message: format!(
                "namespace '{}' may only contain ASCII alphanumerics and underscores",
                config.namespace
            ),
        });
    }

    if config.claim_max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "claim_max_attempts must be at least 1".to_string(),
        });
    }

    for (name, value) in [
        ("reconcile_batch_size", config.reconcile_batch_size),
        ("hash_backfill_batch_size", config.hash_backfill_batch_size),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation {
                message: format!("{} must be at least 1", name),
            });
        }
    }

    Ok(())
}
