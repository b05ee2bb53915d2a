use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Gateway server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind to. Loopback by default: the gateway serves a local UI.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer token for authentication (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_port() -> u16 {
    3000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth_token: None,
        }
    }
}

/// Scheduled job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Maximum number of jobs a single conversation may own. `0` disables the limit.
    #[serde(default = "default_max_jobs_per_conversation")]
    pub max_jobs_per_conversation: usize,
    /// How many times a fire is retried while its conversation is busy.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between busy-conversation retries, in milliseconds.
    #[serde(default = "default_busy_retry_delay_ms")]
    pub busy_retry_delay_ms: u64,
}

fn default_max_jobs_per_conversation() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_busy_retry_delay_ms() -> u64 {
    30_000
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_conversation: default_max_jobs_per_conversation(),
            max_retries: default_max_retries(),
            busy_retry_delay_ms: default_busy_retry_delay_ms(),
        }
    }
}

/// Top-level aion configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AionConfig {
    /// Gateway server config.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Scheduled job config.
    #[serde(default)]
    pub cron: CronConfig,
    /// Directory holding the database (defaults to the config directory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl AionConfig {
    /// Path of the SQLite database file.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => config_dir()?,
        };
        Ok(dir.join("aion.db"))
    }
}

/// Resolve the aion config directory (~/.aion/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".aion"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.aion/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<AionConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    let mut config = load_config_from(&path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<AionConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(AionConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: AionConfig = json5::from_str(&content)?;
    Ok(config)
}

/// `AION_AUTH_TOKEN` and `AION_DATA_DIR` take precedence over the file.
fn apply_env_overrides(config: &mut AionConfig) {
    if let Ok(token) = std::env::var("AION_AUTH_TOKEN") {
        if !token.is_empty() {
            config.gateway.auth_token = Some(token);
        }
    }
    if let Ok(dir) = std::env::var("AION_DATA_DIR") {
        if !dir.is_empty() {
            config.data_dir = Some(PathBuf::from(dir));
        }
    }
}

/// Ensure a directory exists, creating it when missing.
pub fn ensure_dir(dir: &Path) -> Result<(), ConfigError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    ensure_dir(&dir)?;
    Ok(dir)
}

/// Save configuration to the default path.
pub fn save_config(config: &AionConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    let path = dir.join("config.json5");
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}
