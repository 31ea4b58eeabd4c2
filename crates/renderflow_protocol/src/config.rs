//! Layered configuration.
//!
//! Settings are resolved from three layers, later layers winning:
//!   1. a base JSON file (`config/base.json`, or the `RENDERFLOW_CONFIG` path)
//!   2. an environment overlay `config/<ENV_TARGET>.json`
//!   3. `RENDERFLOW_*` environment variables (secrets, URLs)
//!
//! The resolved snapshot is loaded once per process and cached; workers print
//! it on boot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::defaults;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Read-only settings snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Database
    pub database_url: String,
    pub db_pool_size: u32,
    pub statement_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub idle_in_transaction_timeout_ms: u64,

    // Topic namespace for the bus and the event buffer
    pub namespace: String,

    // Rendering backend
    pub backend_url: String,
    pub backend_timeout_secs: u64,
    pub backend_poll_interval_secs: f64,
    pub backend_max_wait_secs: u64,
    pub default_checkpoint: String,
    pub default_width: u32,
    pub default_height: u32,
    pub default_batch_size: u32,
    pub output_dir: String,
    pub models_dir: String,

    // Mock backend (tests, local development)
    pub mock_backend_url: String,
    pub mock_output_dir: String,
    pub mock_models_dir: String,

    // Scheduled-task cron specs (seconds-resolution, UTC)
    pub route_transfer_cron: String,
    pub generation_transfer_cron: String,
    pub route_rollup_cron: String,
    pub generation_rollup_cron: String,
    pub tag_cardinality_cron: String,

    // Worker runtime
    pub worker_max_tasks: u32,
    pub generation_soft_limit_secs: u64,
    pub generation_hard_limit_secs: u64,

    /// Name of the active environment overlay, if any.
    pub env_target: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: defaults::DEFAULT_DATABASE_URL.to_string(),
            db_pool_size: 5,
            statement_timeout_ms: 15_000,
            lock_timeout_ms: 5_000,
            idle_in_transaction_timeout_ms: 30_000,
            namespace: defaults::DEFAULT_NAMESPACE.to_string(),
            backend_url: defaults::DEFAULT_BACKEND_URL.to_string(),
            backend_timeout_secs: defaults::DEFAULT_BACKEND_TIMEOUT_SECS,
            backend_poll_interval_secs: defaults::DEFAULT_BACKEND_POLL_INTERVAL_SECS,
            backend_max_wait_secs: defaults::DEFAULT_BACKEND_MAX_WAIT_SECS,
            default_checkpoint: defaults::DEFAULT_CHECKPOINT.to_string(),
            default_width: defaults::DEFAULT_WIDTH,
            default_height: defaults::DEFAULT_HEIGHT,
            default_batch_size: defaults::DEFAULT_BATCH_SIZE,
            output_dir: "output".to_string(),
            models_dir: "models".to_string(),
            mock_backend_url: defaults::DEFAULT_MOCK_BACKEND_URL.to_string(),
            mock_output_dir: "output/mock".to_string(),
            mock_models_dir: "models/mock".to_string(),
            route_transfer_cron: "0 */10 * * * *".to_string(),
            generation_transfer_cron: "0 */10 * * * *".to_string(),
            route_rollup_cron: "0 0 * * * *".to_string(),
            generation_rollup_cron: "0 0 * * * *".to_string(),
            tag_cardinality_cron: "0 0 4 * * *".to_string(),
            worker_max_tasks: 100,
            generation_soft_limit_secs: 25 * 60,
            generation_hard_limit_secs: 30 * 60,
            env_target: None,
        }
    }
}

impl Settings {
    /// Resolve settings from the standard layers.
    pub fn load() -> Result<Self, ConfigError> {
        let base_path = std::env::var("RENDERFLOW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/base.json"));
        let env_target = std::env::var("ENV_TARGET").ok();

        let mut merged = Value::Object(Default::default());
        merge_file_if_present(&mut merged, &base_path)?;
        if let Some(target) = &env_target {
            let overlay = base_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(format!("{target}.json"));
            merge_file_if_present(&mut merged, &overlay)?;
        }
        apply_env_overrides(&mut merged);

        let mut settings: Settings = serde_json::from_value(merged)?;
        settings.env_target = env_target;
        Ok(settings)
    }

    /// In-memory settings for tests: in-memory database, `renderflow_test`
    /// namespace, mock backend selected by default paths.
    pub fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            namespace: "renderflow_test".to_string(),
            ..Self::default()
        }
    }

    /// One-line-per-field snapshot printed by worker processes on boot.
    pub fn boot_banner(&self) -> String {
        format!(
            "environment: {}\nnamespace: {}\nbackend url: {}\ndatabase: {}\nmax wait: {}s",
            self.env_target.as_deref().unwrap_or("unknown"),
            self.namespace,
            self.backend_url,
            self.database_url,
            self.backend_max_wait_secs,
        )
    }
}

fn merge_file_if_present(target: &mut Value, path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        debug!("config layer {} not present, skipping", path.display());
        return Ok(());
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let layer: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    merge_values(target, layer);
    Ok(())
}

fn merge_values(target: &mut Value, layer: Value) {
    match (target, layer) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `RENDERFLOW_<KEY>` overrides. Values are parsed as JSON scalars
/// where possible (numbers, booleans) and fall back to strings.
fn apply_env_overrides(target: &mut Value) {
    let Value::Object(map) = target else { return };
    for (key, raw) in std::env::vars() {
        let Some(suffix) = key.strip_prefix("RENDERFLOW_") else {
            continue;
        };
        if suffix == "CONFIG" {
            continue;
        }
        let field = suffix.to_lowercase();
        let value = raw
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| raw.parse::<f64>().map(Value::from))
            .or_else(|_| raw.parse::<bool>().map(Value::from))
            .unwrap_or_else(|_| Value::String(raw));
        map.insert(field, value);
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Process-wide cached settings snapshot. Falls back to defaults when the
/// layered load fails (the failure is logged by the caller via the Result on
/// the first explicit `Settings::load`).
pub fn get_settings() -> &'static Settings {
    SETTINGS.get_or_init(|| Settings::load().unwrap_or_default())
}
