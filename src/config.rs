use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logstream::ReconnectPolicy;
use crate::registry::RegistryOptions;

/// Top-level client config, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoint: EndpointConfig,
    pub terminal: TerminalConfig,
    pub logs: LogsConfig,
    pub transport: TransportConfig,
}

/// Dashboard backend location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// WebSocket base URL (`ws://` or `wss://`).
    pub base_url: String,
    /// Bearer token sent on every connection.
    pub token: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:8080".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Scrollback retained per session, in bytes.
    pub scrollback_bytes: usize,
    pub max_sessions: Option<usize>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            scrollback_bytes: 1024 * 1024,
            max_sessions: Some(RegistryOptions::DEFAULT_MAX_SESSIONS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub handshake_timeout_ms: u64,
    pub ping_interval_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            ping_interval_secs: 30,
        }
    }
}

/// Errors that can occur when loading or validating config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Default location: `$XDG_CONFIG_HOME/kubeterm/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kubeterm").join("config.toml"))
    }

    /// Load config from a TOML file. A missing file yields the defaults.
    ///
    /// Warns if the file is world-readable, since it may hold a token.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.endpoint.base_url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "endpoint.base_url must start with ws:// or wss://, got {url:?}"
            )));
        }
        if self.terminal.scrollback_bytes == 0 {
            return Err(ConfigError::Invalid(
                "terminal.scrollback_bytes must be greater than 0".into(),
            ));
        }
        if self.logs.reconnect_base_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "logs.reconnect_base_delay_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            endpoint: self.endpoint.base_url.clone(),
            scrollback_bytes: self.terminal.scrollback_bytes,
            max_sessions: self.terminal.max_sessions,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.logs.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.logs.reconnect_base_delay_ms),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.handshake_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.transport.ping_interval_secs)
    }
}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}). \
             It may contain a token -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
