//! Application configuration for CodeKB.
//!
//! User config lives at `~/.codekb/codekb.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CodeKbError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "codekb.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".codekb";

// ---------------------------------------------------------------------------
// Config structs (matching codekb.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Orchestration limits and timings.
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Default model identifiers.
    #[serde(default)]
    pub models: ModelsConfig,

    /// Default scan patterns.
    #[serde(default)]
    pub scan: ScanConfig,
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the HTTP server binds to.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3001".into()
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Maximum number of simultaneously active runs.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// How long finished runs stay queryable.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Interval of the eviction sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Delay before a finished run's stream connections are closed.
    #[serde(default = "default_stream_close_grace_ms")]
    pub stream_close_grace_ms: u64,

    /// Per-run event channel and per-connection buffer size.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Where step executors write their artifacts. `~` expands to home.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stream_close_grace_ms: default_stream_close_grace_ms(),
            event_buffer: default_event_buffer(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

impl PipelineSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stream_close_grace(&self) -> Duration {
        Duration::from_millis(self.stream_close_grace_ms)
    }

    /// Resolve `artifact_dir`, expanding a leading `~`.
    pub fn artifact_root(&self) -> Result<PathBuf> {
        expand_home(&self.artifact_dir)
    }
}

fn default_max_concurrent_runs() -> usize {
    3
}
fn default_retention_secs() -> u64 {
    60 * 60
}
fn default_sweep_interval_secs() -> u64 {
    15 * 60
}
fn default_stream_close_grace_ms() -> u64 {
    5_000
}
fn default_event_buffer() -> usize {
    256
}
fn default_artifact_dir() -> String {
    "~/.codekb/artifacts".into()
}

/// `[models]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Model used for semantic enrichment when a request names none.
    #[serde(default = "default_enrichment_model")]
    pub enrichment_model: String,

    /// Model used for vectorization when a request names none.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            enrichment_model: default_enrichment_model(),
            embedding_model: default_embedding_model(),
        }
    }
}

fn default_enrichment_model() -> String {
    "gpt-4o-mini".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

/// `[scan]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Include globs used when a request names none.
    #[serde(default = "default_file_patterns")]
    pub file_patterns: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            file_patterns: default_file_patterns(),
        }
    }
}

fn default_file_patterns() -> Vec<String> {
    ["**/*.rs", "**/*.ts", "**/*.tsx", "**/*.js", "**/*.py", "**/*.go", "**/*.java"]
        .into_iter()
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.codekb/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CodeKbError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.codekb/codekb.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CodeKbError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        CodeKbError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CodeKbError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CodeKbError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CodeKbError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject settings the orchestrator cannot run with.
pub fn validate(config: &AppConfig) -> Result<()> {
    if config.pipeline.max_concurrent_runs == 0 {
        return Err(CodeKbError::config(
            "pipeline.max_concurrent_runs must be at least 1",
        ));
    }
    if config.pipeline.event_buffer == 0 {
        return Err(CodeKbError::config("pipeline.event_buffer must be at least 1"));
    }
    if config.pipeline.sweep_interval_secs == 0 {
        return Err(CodeKbError::config(
            "pipeline.sweep_interval_secs must be at least 1",
        ));
    }
    Ok(())
}

fn expand_home(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| CodeKbError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}
