// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration for module channels and the simulation host.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Upper bound on a single control message.
pub const MAX_MESSAGE_SIZE_LIMIT: usize = 64 * 1024;

/// Upper bound on channel slots.
pub const MAX_CAPACITY: usize = 1 << 16;

const CONFIG_FILE: &str = "patchcord.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No config directory found")]
    NoConfigDir,
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Sizing of a module's message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Message slots; rounded up to a power of 2 (minimum 2).
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Largest message in bytes. Every slot reserves this much.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_capacity() -> usize {
    64
}

fn default_max_message_size() -> usize {
    256
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl ChannelConfig {
    pub fn new(capacity: usize, max_message_size: usize) -> Self {
        Self {
            capacity,
            max_message_size,
        }
    }

    /// Check the sizes are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "channel capacity must be between 1 and {}, got {}",
                MAX_CAPACITY, self.capacity
            )));
        }
        if self.max_message_size == 0 || self.max_message_size > MAX_MESSAGE_SIZE_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_message_size must be between 1 and {}, got {}",
                MAX_MESSAGE_SIZE_LIMIT, self.max_message_size
            )));
        }
        Ok(())
    }
}

/// Settings for the `patchcord-sim` host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_buffer_frames")]
    pub buffer_frames: usize,
    #[serde(default = "default_channels")]
    pub input_channels: usize,
    #[serde(default = "default_channels")]
    pub output_channels: usize,
    /// Quanta to run before stopping.
    #[serde(default = "default_quanta")]
    pub quanta: u64,
    /// Concurrent control threads posting messages.
    #[serde(default = "default_producers")]
    pub producers: usize,
    #[serde(default = "default_messages_per_producer")]
    pub messages_per_producer: usize,
    /// Sleep one buffer period per quantum, like a real device would.
    #[serde(default = "default_true")]
    pub paced: bool,
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_buffer_frames() -> usize {
    256
}

fn default_channels() -> usize {
    2
}

fn default_quanta() -> u64 {
    2000
}

fn default_producers() -> usize {
    4
}

fn default_messages_per_producer() -> usize {
    500
}

fn default_true() -> bool {
    true
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            buffer_frames: default_buffer_frames(),
            input_channels: default_channels(),
            output_channels: default_channels(),
            quanta: default_quanta(),
            producers: default_producers(),
            messages_per_producer: default_messages_per_producer(),
            paced: true,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".into()));
        }
        if self.buffer_frames == 0 {
            return Err(ConfigError::Invalid("buffer_frames must be positive".into()));
        }
        if self.output_channels == 0 {
            return Err(ConfigError::Invalid(
                "output_channels must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Complete host configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl HostConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel.validate()?;
        self.simulation.validate()
    }
}

/// Configuration manager handles loading and saving config files.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Use the platform config directory.
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = directories::ProjectDirs::from("org", "patchcord", "patchcord")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;

        Ok(Self::with_dir(config_dir))
    }

    /// Use an explicit directory.
    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        debug!("Config directory: {:?}", config_dir);
        Self { config_dir }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Path of the host config file.
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Load host configuration, falling back to defaults if there is no file.
    pub fn load_host_config(&self) -> Result<HostConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            debug!("No host config found, using defaults");
            return Ok(HostConfig::default());
        }

        Self::load_file(&path)
    }

    /// Load host configuration from a specific file.
    pub fn load_file(path: &Path) -> Result<HostConfig, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = HostConfig::from_toml(&content)?;
        info!("Loaded host config from {:?}", path);
        Ok(config)
    }

    /// Save host configuration.
    pub fn save_host_config(&self, config: &HostConfig) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.config_dir)?;
        let path = self.config_path();
        let content = config.to_toml()?;
        fs::write(&path, content)?;
        debug!("Saved host config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.channel.capacity, 64);
        assert_eq!(config.channel.max_message_size, 256);
        assert_eq!(config.simulation.sample_rate, 48000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = HostConfig::from_toml(
            r#"
            [channel]
            capacity = 16

            [simulation]
            paced = false
            "#,
        )
        .unwrap();

        assert_eq!(config.channel.capacity, 16);
        assert_eq!(config.channel.max_message_size, 256);
        assert!(!config.simulation.paced);
        assert_eq!(config.simulation.buffer_frames, 256);
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(ChannelConfig::new(0, 16).validate().is_err());
        assert!(ChannelConfig::new(16, 0).validate().is_err());
        assert!(ChannelConfig::new(16, MAX_MESSAGE_SIZE_LIMIT + 1)
            .validate()
            .is_err());
        assert!(ChannelConfig::new(MAX_CAPACITY + 1, 16).validate().is_err());
        assert!(ChannelConfig::new(1, 1).validate().is_ok());

        let err = HostConfig::from_toml("[channel]\ncapacity = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().join("nested"));

        // Missing file falls back to defaults
        assert_eq!(manager.load_host_config().unwrap(), HostConfig::default());

        let mut config = HostConfig::default();
        config.channel.capacity = 128;
        config.simulation.producers = 2;
        manager.save_host_config(&config).unwrap();

        assert_eq!(manager.load_host_config().unwrap(), config);
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[channel\ncapacity = ").unwrap();

        assert!(matches!(
            ConfigManager::load_file(&path),
            Err(ConfigError::TomlParse(_))
        ));
    }
}
