//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env var > default file
//! > built-in defaults. `DATA_DIR` overrides `storage.data_dir` after the
//! file is read. API keys never live in the TOML; they come from the
//! environment under `pool.env_prefix`.

use gemini_pool::{DEFAULT_ENV_PREFIX, DEFAULT_STATE_FILE, RotatorConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const DEFAULT_CONFIG_FILE: &str = "gemini-pool.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Key pool limits and where to find keys
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: u64,
}

/// Where the usage state file lives
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            env_prefix: default_env_prefix(),
            daily_limit: default_daily_limit(),
            cooldown_hours: default_cooldown_hours(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            state_file: default_state_file(),
        }
    }
}

fn default_env_prefix() -> String {
    DEFAULT_ENV_PREFIX.to_string()
}

fn default_daily_limit() -> u32 {
    RotatorConfig::default().daily_limit
}

fn default_cooldown_hours() -> u64 {
    24
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_state_file() -> String {
    DEFAULT_STATE_FILE.to_string()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from the resolved path. A missing file is only tolerated when no
    /// path was asked for explicitly; then built-in defaults apply.
    pub fn load_resolved(cli_path: Option<&str>) -> common::Result<(Self, PathBuf)> {
        let explicit = cli_path.is_some() || std::env::var_os("CONFIG_PATH").is_some();
        let path = Self::resolve_path(cli_path);

        if !explicit && !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            let mut config = Config::default();
            config.apply_env();
            config.validate()?;
            return Ok((config, path));
        }

        let config = Self::load(&path)?;
        Ok((config, path))
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    /// Full path of the usage state file.
    pub fn state_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.state_file)
    }

    pub fn rotator_config(&self) -> RotatorConfig {
        RotatorConfig {
            daily_limit: self.pool.daily_limit,
            cooldown: Duration::from_secs(self.pool.cooldown_hours.saturating_mul(60 * 60)),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("DATA_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.storage.data_dir = PathBuf::from(dir);
            }
        }
    }

    fn validate(&self) -> common::Result<()> {
        if self.pool.env_prefix.trim().is_empty() {
            return Err(common::Error::Config("env_prefix must not be empty".into()));
        }
        if self.pool.daily_limit == 0 {
            return Err(common::Error::Config(
                "daily_limit must be greater than 0".into(),
            ));
        }
        if self.pool.cooldown_hours == 0 {
            return Err(common::Error::Config(
                "cooldown_hours must be greater than 0".into(),
            ));
        }
        if self.storage.state_file.trim().is_empty() {
            return Err(common::Error::Config("state_file must not be empty".into()));
        }
        Ok(())
    }
}
