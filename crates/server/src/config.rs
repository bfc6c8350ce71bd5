//! Configuration management for the Homeshare server.
//!
//! Bootstrap settings live in a TOML file with `[daemon]`, `[storage]` and
//! `[preview]` sections, each of which may be omitted.
//! The default configuration path is `~/.config/homeshare/config.toml`.
//! The identity registry is a separate JSON document; see
//! [`crate::registry`].

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::preview::{ConverterScript, PipelineOptions};

/// Reasons a configuration is rejected at startup.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("preview workers must be between 1 and 64, got {0}")]
    InvalidWorkers(usize),

    #[error("preview queue_factor must be at least 1, got {0}")]
    InvalidQueueFactor(usize),

    #[error("save_interval_secs must be between 1 and 3600, got {0}")]
    InvalidSaveInterval(u64),

    #[error("listen_addr must be a socket address, got {0}")]
    InvalidListenAddr(String),

    #[error("preview shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Accepted `daemon.log_level` values, compared case-insensitively.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Homeshare server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Process-level settings.
    pub daemon: DaemonConfig,

    /// Storage layout and persistence.
    pub storage: StorageConfig,

    /// Preview generation.
    pub preview: PreviewConfig,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Default `tracing` filter level; `RUST_LOG` wins when set.
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Storage layout and persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one sandbox per identity.
    pub root: PathBuf,

    /// Registry snapshot file.
    pub registry_path: PathBuf,

    /// Seconds between persistence cycles.
    pub save_interval_secs: u64,

    /// Address the front-end listens on.
    pub listen_addr: String,
}

/// Preview generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreviewConfig {
    /// Number of conversion workers; 1 converts on the caller.
    pub workers: usize,

    /// Queue slots per worker.
    pub queue_factor: usize,

    /// Skip submissions whose output is already being converted.
    pub dedupe_in_flight: bool,

    /// Shell used to run the converter script.
    pub shell: String,

    /// Converter script. Previews are disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,

    /// Working directory of the converter; defaults to the script's directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Directory where generated previews are cached.
    pub cache_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_data_dir().join("storage"),
            registry_path: crate::registry::default_registry_path(),
            save_interval_secs: 5,
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        let pipeline = PipelineOptions::default();
        Self {
            workers: pipeline.workers,
            queue_factor: pipeline.queue_factor,
            dedupe_in_flight: pipeline.dedupe_in_flight,
            shell: "/bin/sh".to_string(),
            script: None,
            working_dir: None,
            cache_dir: default_data_dir().join("previews"),
        }
    }
}

impl StorageConfig {
    /// Interval between persistence cycles.
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }
}

impl PreviewConfig {
    /// Pipeline sizing for these settings.
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            workers: self.workers,
            queue_factor: self.queue_factor,
            dedupe_in_flight: self.dedupe_in_flight,
        }
    }

    /// The converter script, if previews are enabled.
    pub fn converter_script(&self) -> Option<ConverterScript> {
        let script = ConverterScript::new(self.script.as_ref()?);
        Some(match &self.working_dir {
            Some(dir) => script.with_working_dir(dir),
            None => script,
        })
    }
}

/// `~/.config/homeshare/config.toml`, or `./homeshare/config.toml` without a config dir.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("homeshare")
        .join("config.toml")
}

/// Base directory for storage and preview caches.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("homeshare")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - HOMESHARE_STORAGE_ROOT: Override the storage root
    /// - HOMESHARE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - HOMESHARE_PREVIEW_WORKERS: Override the preview worker count
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("HOMESHARE_STORAGE_ROOT") {
            if !root.is_empty() {
                tracing::info!("Overriding storage root from environment: {}", root);
                self.storage.root = PathBuf::from(root);
            }
        }

        if let Ok(level) = std::env::var("HOMESHARE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(workers) = std::env::var("HOMESHARE_PREVIEW_WORKERS") {
            match workers.parse::<usize>() {
                Ok(count) => {
                    tracing::info!("Overriding preview workers from environment: {}", count);
                    self.preview.workers = count;
                }
                Err(_) if workers.is_empty() => {}
                Err(_) => tracing::warn!(
                    "Ignoring HOMESHARE_PREVIEW_WORKERS={:?}: not a number",
                    workers
                ),
            }
        }
    }

    /// Checks ranges, the listen address, the converter shell and the log level.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=64).contains(&self.preview.workers) {
            return Err(ConfigError::InvalidWorkers(self.preview.workers));
        }

        if self.preview.queue_factor < 1 {
            return Err(ConfigError::InvalidQueueFactor(self.preview.queue_factor));
        }

        if !(1..=3600).contains(&self.storage.save_interval_secs) {
            return Err(ConfigError::InvalidSaveInterval(
                self.storage.save_interval_secs,
            ));
        }

        if self.storage.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.storage.listen_addr.clone(),
            ));
        }

        let shell_path = Path::new(&self.preview.shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.preview.shell.clone()));
            }
        } else if which::which(&self.preview.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(self.preview.shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Reads `path`, falling back to defaults when it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No config at {:?}, using built-in defaults", path);
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", path.display()));
            }
        };

        Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parses a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| anyhow::anyhow!(describe_toml_error(toml_str, &e)))
    }

    /// Writes the configuration to `path` through a temporary file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let contents = self.to_toml()?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        let staging = path.with_extension("toml.tmp");
        fs::write(&staging, contents)
            .and_then(|()| fs::rename(&staging, path))
            .with_context(|| format!("Cannot write {}", path.display()))?;

        tracing::info!("Wrote configuration to {:?}", path);
        Ok(())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// `line:column: message` for a parse error, 1-based.
fn describe_toml_error(source: &str, error: &toml::de::Error) -> String {
    let message = error.message().trim_end();
    let Some(span) = error.span() else {
        return format!("bad TOML: {message}");
    };
    let before = source.get(..span.start).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let column = before.len() - before.rfind('\n').map_or(0, |i| i + 1) + 1;
    format!("bad TOML at {line}:{column}: {message}")
}
