//! Engine configuration.

use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Tunables for the dispatch subsystem.
///
/// Every field has a default, so a TOML file only needs to list overrides:
///
/// ```toml
/// invocations_per_batch_job = 50
/// max_ids_per_statement = 900
/// ```
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Characters of a failure message kept on the live task row.
    pub error_message_max_len: usize,
    /// Upper bound on literal ids bound into one SQL statement.
    pub max_ids_per_statement: usize,
    /// Task ids handled by one async batch chunk.
    pub invocations_per_batch_job: usize,
    /// Chunks materialized per seed step of an async batch.
    pub batch_jobs_per_seed: usize,
    /// Cap on the timeout of a long-poll fetch.
    pub long_poll_max_timeout_ms: u64,
    /// Priority for tasks whose activity and process define none.
    pub default_priority: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            error_message_max_len: 666,
            max_ids_per_statement: 500,
            invocations_per_batch_job: 1,
            batch_jobs_per_seed: 100,
            long_poll_max_timeout_ms: 1_800_000,
            default_priority: 0,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                cfg.validate()?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_ids_per_statement == 0 {
            anyhow::bail!("max_ids_per_statement must be at least 1");
        }
        if self.invocations_per_batch_job == 0 {
            anyhow::bail!("invocations_per_batch_job must be at least 1");
        }
        if self.batch_jobs_per_seed == 0 {
            anyhow::bail!("batch_jobs_per_seed must be at least 1");
        }
        Ok(())
    }
}
