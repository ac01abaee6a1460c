//! Engine Configuration
//!
//! Settings that shape how the engine records history, schedules jobs and
//! resolves joins. Every field has a default so a YAML file only needs to
//! name what it overrides.
//!
//! # Example YAML Format
//!
//! ```yaml
//! history_level: full
//! default_job_retries: 5
//! job_lock_duration_ms: 60000
//! join_policy: force_join_when_unreachable
//! ```

use std::error::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::APP_NAME;

/// Lock owner used when the configuration names none.
static DEFAULT_LOCK_OWNER: Lazy<String> =
    Lazy::new(|| format!("{}-{}", APP_NAME.to_lowercase(), std::process::id()));

/// How much history is written after each commit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HistoryLevel {
    /// No history at all
    None,
    /// Process and activity instances
    Activity,
    /// Activity history plus every variable update
    Full,
}

/// What happens to a parallel join that can no longer receive all branches.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Keep waiting; the stalled branch must be cancelled explicitly.
    WaitForAllBranches,
    /// Join with the branches that arrived once no live branch can reach the gateway.
    ForceJoinWhenUnreachable,
}

/// Engine-wide settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub history_level: HistoryLevel,

    /// Retries given to new jobs unless the node overrides them
    pub default_job_retries: u32,

    /// How long a claimed job stays locked to its worker
    pub job_lock_duration_ms: u64,

    /// Maximum jobs claimed per acquisition round
    pub job_acquisition_size: usize,

    /// Poller sleep when no job is due
    pub job_idle_wait_ms: u64,

    /// Worker threads for the job executor (0 = one per CPU)
    pub job_worker_threads: usize,

    pub join_policy: JoinPolicy,

    /// Guard against runaway loops inside a single command
    pub max_operations_per_command: usize,

    /// Identifies this engine in job locks
    pub lock_owner: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_level: HistoryLevel::Activity,
            default_job_retries: 3,
            job_lock_duration_ms: 5 * 60 * 1000,
            job_acquisition_size: 10,
            job_idle_wait_ms: 1000,
            job_worker_threads: 0,
            join_policy: JoinPolicy::WaitForAllBranches,
            max_operations_per_command: 100_000,
            lock_owner: DEFAULT_LOCK_OWNER.clone(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn Error>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, Box<dyn Error>> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Lock duration, saturating at the largest representable span.
    pub fn job_lock_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.job_lock_duration_ms).unwrap_or(i64::MAX))
    }

    pub fn job_idle_wait(&self) -> Duration {
        Duration::from_millis(self.job_idle_wait_ms)
    }

    /// Worker threads, resolving 0 to the CPU count.
    pub fn worker_threads(&self) -> usize {
        if self.job_worker_threads == 0 {
            num_cpus::get()
        } else {
            self.job_worker_threads
        }
    }

    pub fn set_history_level(&mut self, level: HistoryLevel) {
        self.history_level = level;
    }

    pub fn set_default_job_retries(&mut self, retries: u32) {
        self.default_job_retries = retries;
    }

    pub fn set_join_policy(&mut self, policy: JoinPolicy) {
        self.join_policy = policy;
    }

    pub fn set_job_worker_threads(&mut self, threads: usize) {
        self.job_worker_threads = threads;
    }

    pub fn set_lock_owner(&mut self, owner: impl Into<String>) {
        self.lock_owner = owner.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_job_retries, 3);
        assert_eq!(config.history_level, HistoryLevel::Activity);
        assert_eq!(config.join_policy, JoinPolicy::WaitForAllBranches);
        assert!(config.lock_owner.starts_with("procrunner-"));
        assert!(config.worker_threads() >= 1);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml(
            "history_level: full\njoin_policy: force_join_when_unreachable\n",
        )
        .unwrap();

        assert_eq!(config.history_level, HistoryLevel::Full);
        assert_eq!(config.join_policy, JoinPolicy::ForceJoinWhenUnreachable);
        assert_eq!(config.job_acquisition_size, 10);
    }

    #[test]
    fn test_oversized_lock_duration_saturates() {
        let config = EngineConfig::from_yaml("job_lock_duration_ms: 18446744073709551615\n").unwrap();
        assert_eq!(config.job_lock_duration().num_milliseconds(), i64::MAX);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = EngineConfig::from_yaml("  \n").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_invalid_history_level_rejected() {
        assert!(EngineConfig::from_yaml("history_level: everything\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "default_job_retries: 7\njob_worker_threads: 2").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.default_job_retries, 7);
        assert_eq!(config.worker_threads(), 2);
    }

    #[test]
    fn test_setters() {
        let mut config = EngineConfig::default();
        config.set_history_level(HistoryLevel::None);
        config.set_default_job_retries(1);
        config.set_lock_owner("node-a");

        assert_eq!(config.history_level, HistoryLevel::None);
        assert_eq!(config.default_job_retries, 1);
        assert_eq!(config.lock_owner, "node-a");
        assert!(HistoryLevel::Full > HistoryLevel::Activity);
    }
}
