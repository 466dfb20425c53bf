use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BIND: &str = "127.0.0.1:8787";
pub const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_COOKIE_NAME: &str = "or_key";
pub const DEFAULT_SECRET_ENV: &str = "CHATWIRE_COOKIE_SECRET";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub provider: ProviderConfig,
    pub credentials: CredentialsConfig,
    pub mcp: McpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            provider: ProviderConfig::default(),
            credentials: CredentialsConfig::default(),
            mcp: McpConfig::default(),
        }
    }
}

/// Upstream chat completions gateway.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub app_name: String,
    pub referer: Option<String>,
    /// Model round-trips allowed for tool calls within one turn.
    pub max_tool_steps: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENROUTER_BASE_URL.to_string(),
            app_name: "Chatwire".to_string(),
            referer: None,
            max_tool_steps: 8,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CredentialsConfig {
    pub cookie_name: String,
    /// Name of the environment variable holding the cookie sealing secret.
    pub secret_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            secret_env: DEFAULT_SECRET_ENV.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct McpConfig {
    pub connect_timeout_secs: u64,
    pub tool_fetch_timeout_secs: u64,
    pub tool_call_timeout_secs: u64,
    pub close_timeout_secs: u64,
    pub max_concurrent_connects: usize,
    pub max_tools_per_server: usize,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            tool_fetch_timeout_secs: 10,
            tool_call_timeout_secs: 60,
            close_timeout_secs: 5,
            max_concurrent_connects: 8,
            max_tools_per_server: 100,
        }
    }
}

impl McpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn tool_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_fetch_timeout_secs.max(1))
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_call_timeout_secs.max(1))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs.max(1))
    }
}

/// Returns a user-friendly representation of a path, abbreviating the home
/// directory with `~` when possible.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
