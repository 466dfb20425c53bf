use crate::core::config::data::{path_display, Config};
use directories::ProjectDirs;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const BIND_ENV: &str = "CHATWIRE_BIND";
pub const OPENROUTER_BASE_URL_ENV: &str = "CHATWIRE_OPENROUTER_BASE_URL";

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read {
        /// Path to the configuration file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        /// Path to the configuration file with invalid TOML.
        path: PathBuf,
        /// The TOML deserialization error.
        source: toml::de::Error,
    },
}

impl ConfigError {
    fn display_path(path: &Path) -> String {
        path_display(path)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(
                    f,
                    "Failed to read config at {}: {}",
                    Self::display_path(path),
                    source
                )
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "Failed to parse config at {}: {}",
                    Self::display_path(path),
                    source
                )
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl Config {
    /// Missing files yield the defaults.
    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        if !config_path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    /// Loads from `explicit_path` or the platform config directory, then
    /// applies environment overrides.
    pub fn load(explicit_path: Option<&Path>) -> Result<Config, ConfigError> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .or_else(Self::get_config_path);
        let mut config = match path {
            Some(path) => Self::load_from_path(&path)?,
            None => Config::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn get_config_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "permacommons", "chatwire")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(bind) = non_blank(BIND_ENV) {
            self.bind = bind.trim().to_string();
        }
        if let Some(base_url) = non_blank(OPENROUTER_BASE_URL_ENV) {
            self.provider.base_url = base_url.trim().to_string();
        }
    }

    /// The cookie sealing secret, read from the configured environment variable.
    pub fn cookie_secret<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(&self.credentials.secret_env).filter(|value| !value.trim().is_empty())
    }
}
