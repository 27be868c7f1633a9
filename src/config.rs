use crate::error::{Result, ShareError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that points at an explicit config file
pub const CONFIG_ENV: &str = "TUNSHARE_CONFIG";

/// Default tunnel agent status endpoint
pub const DEFAULT_API_URL: &str = "http://localhost:4040/api/tunnels";

/// Top-level configuration, layered from file, environment and CLI
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Local HTTP port (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Editor command used when no content is given
    pub editor: Option<String>,

    /// Basic auth credentials forwarded to the tunnel, as `user:password`
    pub basic_auth: Option<String>,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    /// Tunnel binary name or path (default: ngrok)
    #[serde(default = "default_tunnel_binary")]
    pub binary: String,

    /// Status endpoint listing active tunnels
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Delay before the first status query in milliseconds
    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,

    /// Number of status query attempts (minimum 1)
    #[serde(default = "default_query_attempts")]
    pub query_attempts: u32,

    /// Base backoff between attempts in milliseconds, doubled each retry
    #[serde(default = "default_query_backoff")]
    pub query_backoff_ms: u64,

    /// Per-request timeout for the status query in milliseconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL when stopping the tunnel
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl TunnelConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Backoff before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.query_backoff_ms.saturating_mul(factor))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: default_tunnel_binary(),
            api_url: default_api_url(),
            startup_grace_ms: default_startup_grace(),
            query_attempts: default_query_attempts(),
            query_backoff_ms: default_query_backoff(),
            query_timeout_ms: default_query_timeout(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// How long `start` waits for the listener to accept a probe connection
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
}

impl ServerConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            editor: None,
            basic_auth: None,
            tunnel: TunnelConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_tunnel_binary() -> String {
    "ngrok".to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_startup_grace() -> u64 {
    2000
}

fn default_query_attempts() -> u32 {
    3
}

fn default_query_backoff() -> u64 {
    500
}

fn default_query_timeout() -> u64 {
    2000
}

fn default_stop_grace() -> u64 {
    5
}

fn default_ready_timeout() -> u64 {
    1000
}

/// Parsed `user:password` credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

impl BasicAuth {
    pub fn parse(raw: &str) -> Result<Self> {
        let (user, password) = raw.split_once(':').ok_or_else(|| {
            ShareError::Config("basic auth must be in the form 'user:password'".to_string())
        })?;
        if user.is_empty() {
            return Err(ShareError::Config(
                "basic auth user must not be empty".to_string(),
            ));
        }
        Ok(Self {
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    /// Value passed to the tunnel binary's `--basic-auth` option
    pub fn as_arg(&self) -> String {
        format!("{}:{}", self.user, self.password)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ShareError::fs(path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| ShareError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, `$TUNSHARE_CONFIG`, or the user config
    /// directory. A missing default file yields built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(PathBuf::from(path));
        }
        match default_config_path() {
            Some(path) if path.is_file() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Editor command: `EDITOR` wins over the file, `vi` is the fallback
    pub fn editor_command(&self, env_editor: Option<String>) -> String {
        env_editor
            .filter(|e| !e.trim().is_empty())
            .or_else(|| self.editor.clone())
            .unwrap_or_else(|| "vi".to_string())
    }

    pub fn basic_auth(&self) -> Result<Option<BasicAuth>> {
        self.basic_auth.as_deref().map(BasicAuth::parse).transpose()
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.tunnel.query_attempts == 0 {
            errors.push("tunnel.query_attempts must be at least 1".to_string());
        }
        if self.tunnel.binary.trim().is_empty() {
            errors.push("tunnel.binary must not be empty".to_string());
        }
        if !(self.tunnel.api_url.starts_with("http://")
            || self.tunnel.api_url.starts_with("https://"))
        {
            errors.push(format!(
                "tunnel.api_url must be an http(s) URL, got '{}'",
                self.tunnel.api_url
            ));
        }
        if let Err(e) = self.basic_auth() {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            return Err(ShareError::Config(format!(
                "\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }
}

/// `<config dir>/tunshare/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|dir| dir.join("tunshare").join("config.toml"))
}
