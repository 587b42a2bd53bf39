//! Host configuration, read from a TOML file.
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:8080"
//! max_request_bytes = 8388608
//! output_buffer_bytes = 65536
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//!
//! [rhai]
//! max_operations = 0
//!
//! [[servlet]]
//! mount = "/hello"
//! source = "servlets/hello.rhai"
//! ```
//!
//! Every section is optional. Relative servlet paths are resolved against
//! the directory containing the configuration file.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::server::ServerSettings;

/// Guest adapter names a `[[servlet]]` entry may request.
pub const ADAPTER_NAMES: &[&str] = &["rhai", "scheme", "python", "ruby"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub rhai: RhaiConfig,
    #[serde(rename = "servlet")]
    pub servlets: Vec<ServletConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: String,
    pub max_request_bytes: usize,
    pub output_buffer_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let settings = ServerSettings::default();
        Self {
            listen: "127.0.0.1:8080".to_string(),
            max_request_bytes: settings.max_request_bytes,
            output_buffer_bytes: settings.output_buffer_bytes,
        }
    }
}

impl ServerConfig {
    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            max_request_bytes: self.max_request_bytes,
            output_buffer_bytes: self.output_buffer_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as `info` or `rservlet=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RhaiConfig {
    /// Per-invocation operation limit; `0` is unlimited.
    pub max_operations: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServletConfig {
    pub mount: String,
    pub source: PathBuf,
    /// Adapter name; inferred from the file extension when absent.
    #[serde(default)]
    pub adapter: Option<String>,
}

impl Config {
    /// Reads, parses and validates the file at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = text.parse()?;
        if let Some(base) = path.parent() {
            config.resolve_sources(base);
        }
        Ok(config)
    }

    /// Makes relative servlet paths relative to `base`.
    pub fn resolve_sources(&mut self, base: &Path) {
        for servlet in &mut self.servlets {
            if servlet.source.is_relative() {
                servlet.source = base.join(&servlet.source);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("server.listen must not be empty".into()));
        }
        if self.server.max_request_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.max_request_bytes must be greater than zero".into(),
            ));
        }
        if self.server.output_buffer_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.output_buffer_bytes must be greater than zero".into(),
            ));
        }

        let mut mounts = HashSet::new();
        for servlet in &self.servlets {
            if !servlet.mount.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "servlet mount {:?} must start with '/'",
                    servlet.mount
                )));
            }
            if !mounts.insert(servlet.mount.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "servlet mount {:?} is declared twice",
                    servlet.mount
                )));
            }
            if let Some(adapter) = &servlet.adapter {
                if !ADAPTER_NAMES.contains(&adapter.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "servlet {:?} names unknown adapter {adapter:?} (expected one of {})",
                        servlet.mount,
                        ADAPTER_NAMES.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    /// Parses and validates TOML text. Servlet paths are left as written.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}
