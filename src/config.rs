use anyhow::{anyhow, Context, Result};
use log::{debug, info, LevelFilter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::sync::{StatusPolicy, SyncOptions};

pub const ENV_DB: &str = "PARLEY_DB";
pub const ENV_USER: &str = "PARLEY_USER";
pub const ENV_LOG_FILE: &str = "PARLEY_LOG_FILE";
pub const ENV_STATUS_POLICY: &str = "PARLEY_STATUS_POLICY";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub database_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub status_policy: StatusPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
    pub presence_stale_after_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            database_path: None,
            user_id: None,
            status_policy: StatusPolicy::default(),
            heartbeat_interval_secs: None,
            presence_stale_after_secs: 300,
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Database file, falling back to `parley.db` in the config directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_config_dir()?.join("parley.db")),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            status_policy: self.status_policy,
            heartbeat_interval: self.heartbeat_interval_secs.filter(|s| *s > 0).map(Duration::from_secs),
        }
    }

    pub fn presence_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.presence_stale_after_secs.min(i64::MAX as u64) as i64)
    }

    pub fn level_filter(&self) -> LevelFilter {
        parse_level(&self.log_level).unwrap_or(LevelFilter::Info)
    }

    /// Applies `PARLEY_*` environment overrides on top of the file values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(db) = lookup(ENV_DB).filter(|v| !v.is_empty()) {
            self.database_path = Some(PathBuf::from(db));
        }
        if let Some(user) = lookup(ENV_USER).filter(|v| !v.is_empty()) {
            let id = Uuid::parse_str(user.trim()).with_context(|| format!("{} is not a valid user id", ENV_USER))?;
            self.user_id = Some(id);
        }
        if let Some(file) = lookup(ENV_LOG_FILE).filter(|v| !v.is_empty()) {
            self.log_file = Some(PathBuf::from(file));
        }
        if let Some(policy) = lookup(ENV_STATUS_POLICY).filter(|v| !v.is_empty()) {
            self.status_policy = policy.parse().map_err(|e: String| anyhow!("{}: {}", ENV_STATUS_POLICY, e))?;
        }
        Ok(())
    }
}

pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Points config loading and saving at `path` for the rest of the process.
/// Only the first call takes effect.
pub fn set_config_path_override(path: PathBuf) -> bool {
    CONFIG_PATH_OVERRIDE.set(path).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            return Ok(parent.to_path_buf());
        }
    }
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("parley");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("config.json"))
}

/// Reads `path`; a missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        debug!("No config at {}, using defaults", path.display());
        return Ok(ClientConfig::default());
    }
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let config: ClientConfig =
        serde_json::from_reader(file).with_context(|| format!("parsing {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Defaults, then the config file, then environment overrides.
pub fn load_config() -> Result<ClientConfig> {
    let mut config = load_config_from(&get_config_path()?)?;
    config.apply_env()?;
    Ok(config)
}

pub fn save_config_to(path: &Path, config: &ClientConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;
    info!("Config saved to {}", path.display());
    Ok(())
}

pub fn save_config(config: &ClientConfig) -> Result<()> {
    save_config_to(&get_config_path()?, config)
}
