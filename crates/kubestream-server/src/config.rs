//! Server configuration
//!
//! Loaded from an optional TOML file; every value has a default so an empty
//! (or absent) file is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("session.{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub server: ListenConfig,
    pub session: SessionTimings,
    pub inventory: InventoryConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    pub listen: SocketAddr,
    /// Directory with the built web UI; nothing is served when unset
    pub assets: Option<PathBuf>,
    /// Default tracing filter directive (`RUST_LOG` wins when set)
    pub log_level: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            assets: None,
            log_level: "info".to_string(),
        }
    }
}

/// Timers governing every streaming session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionTimings {
    /// How often a liveness ping is sent
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// How long the connection may stay silent before it is considered dead
    #[serde(with = "humantime_serde")]
    pub pong_wait: Duration,
    /// Upper bound on a single write
    #[serde(with = "humantime_serde")]
    pub write_wait: Duration,
    /// How often cluster credentials are rebuilt
    #[serde(with = "humantime_serde")]
    pub credential_refresh: Duration,
}

impl SessionTimings {
    /// Every timer drives an interval or a deadline, so none may be zero
    fn validate(&self) -> Result<(), ConfigError> {
        let timers = [
            ("ping_interval", self.ping_interval),
            ("pong_wait", self.pong_wait),
            ("write_wait", self.write_wait),
            ("credential_refresh", self.credential_refresh),
        ];
        match timers.into_iter().find(|(_, value)| value.is_zero()) {
            Some((name, _)) => Err(ConfigError::ZeroDuration(name)),
            None => Ok(()),
        }
    }
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            credential_refresh: kubestream_k8s::DEFAULT_REFRESH_INTERVAL,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InventoryConfig {
    pub kubectl: PathBuf,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            kubectl: PathBuf::from("kubectl"),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.session.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}
