use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine tuning knobs with conservative defaults. Loadable from a TOML file;
/// individual values can be overridden through `CASCADE_*` environment
/// variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-block execution budget.
    #[serde(default = "default_block_timeout_secs")]
    pub block_timeout_secs: u64,

    /// Whole-run execution budget.
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,

    /// Concurrency cap for the branches of one parallel block.
    #[serde(default = "default_max_parallel_branches")]
    pub max_parallel_branches: usize,

    /// Total attempts for a recoverable block failure (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between retry attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Lock lifetime before auto-expiry; long sections must extend.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Polling interval while waiting on a contended lock.
    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,

    /// How long acquisition blocks before giving up with a busy error.
    #[serde(default = "default_lock_blocking_timeout_secs")]
    pub lock_blocking_timeout_secs: u64,

    /// Lifetime of mirrored state documents and history in the shared store.
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,

    /// Lifetime of idempotency records.
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    /// Directory for the gzip JSONL event log. Events stay in memory when unset.
    #[serde(default)]
    pub event_log_dir: Option<PathBuf>,
}

fn default_block_timeout_secs() -> u64 {
    300
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_max_parallel_branches() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_lock_poll_interval_ms() -> u64 {
    100
}

fn default_lock_blocking_timeout_secs() -> u64 {
    10
}

fn default_state_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_idempotency_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_timeout_secs: default_block_timeout_secs(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
            max_parallel_branches: default_max_parallel_branches(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
            lock_blocking_timeout_secs: default_lock_blocking_timeout_secs(),
            state_ttl_secs: default_state_ttl_secs(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            event_log_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist. Environment overrides are applied afterwards.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `CASCADE_*` environment variable overrides. Unparseable values
    /// are ignored with a warning rather than aborting startup.
    pub fn apply_env_overrides(&mut self) {
        override_u64("CASCADE_BLOCK_TIMEOUT_SECS", &mut self.block_timeout_secs);
        override_u64(
            "CASCADE_WORKFLOW_TIMEOUT_SECS",
            &mut self.workflow_timeout_secs,
        );
        override_usize(
            "CASCADE_MAX_PARALLEL_BRANCHES",
            &mut self.max_parallel_branches,
        );
        override_u32("CASCADE_MAX_ATTEMPTS", &mut self.max_attempts);
        override_u64("CASCADE_RETRY_DELAY_MS", &mut self.retry_delay_ms);
        override_u64("CASCADE_LOCK_TTL_SECS", &mut self.lock_ttl_secs);
        override_u64(
            "CASCADE_LOCK_POLL_INTERVAL_MS",
            &mut self.lock_poll_interval_ms,
        );
        override_u64(
            "CASCADE_LOCK_BLOCKING_TIMEOUT_SECS",
            &mut self.lock_blocking_timeout_secs,
        );
        override_u64("CASCADE_STATE_TTL_SECS", &mut self.state_ttl_secs);
        override_u64(
            "CASCADE_IDEMPOTENCY_TTL_SECS",
            &mut self.idempotency_ttl_secs,
        );
        if let Ok(dir) = std::env::var("CASCADE_EVENT_LOG_DIR") {
            if !dir.is_empty() {
                self.event_log_dir = Some(PathBuf::from(dir));
            }
        }
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block_timeout_secs)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn lock_blocking_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_blocking_timeout_secs)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }
}

fn override_u64(key: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring unparseable {}={}", key, raw),
        }
    }
}

fn override_u32(key: &str, slot: &mut u32) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring unparseable {}={}", key, raw),
        }
    }
}

fn override_usize(key: &str, slot: &mut usize) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring unparseable {}={}", key, raw),
        }
    }
}
