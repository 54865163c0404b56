use crate::sampler::SamplerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_consumer_buffer_capacity")]
    pub consumer_buffer_capacity: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_nvidia_smi_path")]
    pub nvidia_smi_path: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interval_ms: default_interval_ms(),
            device_index: 0,
            buffer_capacity: default_buffer_capacity(),
            consumer_buffer_capacity: default_consumer_buffer_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            nvidia_smi_path: default_nvidia_smi_path(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.interval_ms < 10 {
            return Err(ConfigError::Validation(
                "interval_ms must be >= 10".to_string(),
            ));
        }
        if self.buffer_capacity < 1 {
            return Err(ConfigError::Validation(
                "buffer_capacity must be >= 1".to_string(),
            ));
        }
        if self.consumer_buffer_capacity < 1 {
            return Err(ConfigError::Validation(
                "consumer_buffer_capacity must be >= 1".to_string(),
            ));
        }
        if self.send_timeout_ms < 1 {
            return Err(ConfigError::Validation(
                "send_timeout_ms must be >= 1".to_string(),
            ));
        }
        if self.command_timeout_ms < 1 {
            return Err(ConfigError::Validation(
                "command_timeout_ms must be >= 1".to_string(),
            ));
        }
        if self.nvidia_smi_path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "nvidia_smi_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn sampler(&self) -> SamplerConfig {
        SamplerConfig {
            interval: self.interval(),
            device_index: self.device_index,
            buffer_capacity: self.buffer_capacity,
        }
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

const fn default_interval_ms() -> u64 {
    1000
}

const fn default_buffer_capacity() -> usize {
    100
}

const fn default_consumer_buffer_capacity() -> usize {
    16
}

const fn default_send_timeout_ms() -> u64 {
    2000
}

const fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_nvidia_smi_path() -> String {
    "nvidia-smi".to_string()
}
