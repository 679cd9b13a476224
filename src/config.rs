// src/config.rs

//! Persisted user settings, stored as TOML under the platform config dir.

use std::io;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::canvas::normalize_base_url;
use crate::engine::DEFAULT_CONCURRENCY;

const APP_DIR: &str = "canvasdl";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid Canvas base URL: {0:?}")]
    InvalidBaseUrl(String),
    #[error("invalid config value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("Canvas base URL is required; pass --base-url or run 'canvasdl config set-base-url <url>'")]
    MissingBaseUrl,
    #[error("no platform config directory available")]
    NoConfigDir,
    #[error("could not parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_dest: Option<String>,
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_dest: None,
            default_concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl AppConfig {
    /// The override when given, else the stored URL.
    pub fn resolve_base_url(&self, override_url: Option<&str>) -> Result<String, ConfigError> {
        match override_url {
            Some(url) => validate_base_url(url),
            None => self.base_url.clone().ok_or(ConfigError::MissingBaseUrl),
        }
    }

    /// The configured destination, or `<cwd>/downloads`.
    pub fn destination_path(&self, cwd: &Path) -> PathBuf {
        match &self.default_dest {
            Some(dest) => expand_home(dest),
            None => cwd.join("downloads"),
        }
    }

    fn validate(mut self) -> Result<Self, ConfigError> {
        if let Some(url) = &self.base_url {
            self.base_url = Some(validate_base_url(url)?);
        }
        if matches!(&self.default_dest, Some(dest) if dest.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: "default_dest",
                reason: "must not be empty".into(),
            });
        }
        if self.default_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "default_concurrency",
                reason: "must be a positive integer".into(),
            });
        }
        Ok(self)
    }
}

/// Accepts http(s) URLs with a host and returns them without a trailing
/// slash or `/api/v1` suffix.
pub fn validate_base_url(raw: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidBaseUrl(raw.to_string());
    let parsed = Url::parse(raw.trim()).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(invalid());
    }
    Ok(normalize_base_url(raw))
}

/// Expands a leading `~/` to the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Reads and writes one config file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<platform config dir>/canvasdl/config.toml`
    pub fn default_location() -> Result<Self, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::new(dir.join(APP_DIR).join(CONFIG_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file yields the defaults.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No config file, using defaults");
                return Ok(AppConfig::default());
            }
            Err(e) => return Err(io_error(&self.path)(e)),
        };
        let config: AppConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        config.validate()
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let data = toml::to_string_pretty(config)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let temp = self.path.with_extension("toml.tmp");
        std::fs::write(&temp, data).map_err(io_error(&temp))?;
        std::fs::rename(&temp, &self.path).map_err(io_error(&self.path))?;
        Ok(())
    }

    pub fn set_base_url(&self, url: &str) -> Result<AppConfig, ConfigError> {
        let mut config = self.load()?;
        config.base_url = Some(validate_base_url(url)?);
        self.save(&config)?;
        Ok(config)
    }

    /// Stores `path` as an absolute path.
    pub fn set_default_destination(&self, path: &str) -> Result<AppConfig, ConfigError> {
        if path.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "default_dest",
                reason: "must not be empty".into(),
            });
        }
        let expanded = expand_home(path.trim());
        let absolute = std::path::absolute(&expanded).map_err(io_error(&expanded))?;

        let mut config = self.load()?;
        config.default_dest = Some(absolute.to_string_lossy().into_owned());
        self.save(&config)?;
        Ok(config)
    }

    pub fn clear_default_destination(&self) -> Result<AppConfig, ConfigError> {
        let mut config = self.load()?;
        config.default_dest = None;
        self.save(&config)?;
        Ok(config)
    }
}
