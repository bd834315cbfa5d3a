//! Frontend configuration loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compiler::CompilerConfig;
use crate::dispatch::{DispatchOptions, ExecutorMode};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "GRAPHFLOW_CONFIG";

/// `[dispatch]` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Target selection.
    pub mode: ExecutorMode,
    /// Per-target timeout in milliseconds.
    pub target_timeout_ms: u64,
    /// Records buffered per result channel.
    pub result_buffer: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        let options = DispatchOptions::default();
        Self {
            mode: ExecutorMode::default(),
            target_timeout_ms: options.target_timeout.as_millis() as u64,
            result_buffer: options.result_buffer,
        }
    }
}

impl DispatchSection {
    /// Runtime dispatch options.
    pub fn options(&self) -> DispatchOptions {
        DispatchOptions {
            target_timeout: Duration::from_millis(self.target_timeout_ms),
            result_buffer: self.result_buffer,
        }
    }
}

/// `[logging]` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Settings of one frontend node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Node id stamped into write sessions.
    pub node_id: u32,
    /// Compiler knobs.
    pub compiler: CompilerConfig,
    /// Dispatch knobs.
    pub dispatch: DispatchSection,
    /// Log filter.
    pub logging: LoggingSection,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl FrontendConfig {
    /// Loads `explicit`, or `$GRAPHFLOW_CONFIG`, or the platform default
    /// path. A missing file yields the defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(default_config_path);
        let mut config = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => FrontendConfig::default(),
        };
        config.path = path;
        Ok(config)
    }

    /// Parses a config from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Path the config was loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the config back to its path.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoConfigPath)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })
    }
}

fn read_file(path: &Path) -> Result<FrontendConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Platform default config location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("graphflow").join("frontend.toml"))
}

/// Config loading and saving failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// Serializing the config failed.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// Writing the file failed.
    #[error("failed to write config {path}: {source}")]
    Write {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Creating the parent directory failed.
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// No path to save to.
    #[error("no config path; pass --config or set GRAPHFLOW_CONFIG")]
    NoConfigPath,
}
