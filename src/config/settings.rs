use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings stored in settings.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load from the default location, creating the file with defaults if missing
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::paths::settings_file().ok_or_else(|| ConfigError::ReadFile {
            path: PathBuf::from("settings.toml"),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config file path",
            ),
        })?;

        if !path.exists() {
            let settings = Self::default();
            settings.save()?;
            return Ok(settings);
        }

        Self::load_from(&path)
    }

    /// Load from an explicit file; a missing file is an error here
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let settings: Self = toml::from_str(&content).map_err(ConfigError::Parse)?;
        Ok(settings.normalized())
    }

    /// Save to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        super::paths::ensure_config_dir().map_err(ConfigError::CreateDir)?;

        let path = super::paths::settings_file().ok_or_else(|| ConfigError::WriteFile {
            path: PathBuf::from("settings.toml"),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config file path",
            ),
        })?;

        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Replace values that would make the pool or the copy loop unusable
    fn normalized(mut self) -> Self {
        if self.pool.capacity == 0 {
            self.pool.capacity = 1;
        }
        if self.transfer.chunk_size == 0 {
            self.transfer.chunk_size = default_chunk_size();
        }
        self
    }
}

fn default_capacity() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_checkout_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSettings {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_checkout_timeout")]
    pub checkout_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            idle_timeout_secs: default_idle_timeout(),
            checkout_timeout_secs: default_checkout_timeout(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    60
}

fn default_port() -> u16 {
    22
}

/// How server host keys are checked against known_hosts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Only hosts already present in known_hosts are accepted
    Strict,
    /// Unknown hosts are learned on first contact; changed keys are rejected
    #[default]
    AcceptNew,
    /// Every key is accepted. Only for lab setups.
    AcceptAny,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshSettings {
    #[serde(default = "default_timeout")]
    pub connection_timeout_secs: u64,
    /// 0 disables keepalives
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive(),
            default_port: default_port(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
        }
    }
}

fn default_file_mode() -> u32 {
    0o644
}

fn default_chunk_size() -> usize {
    32 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferSettings {
    /// Permissions applied to every file written remotely
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            file_mode: default_file_mode(),
            chunk_size: default_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily-rotated log files; console only when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}
