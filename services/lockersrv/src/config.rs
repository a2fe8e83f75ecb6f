//! Service configuration
//!
//! Layered with Figment: built-in defaults, then an optional YAML/TOML/JSON file,
//! then `LOCKERSRV_*` environment variables (`__` separates nested keys, e.g.
//! `LOCKERSRV_CONTROLLER__HOST`).

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LockerError, Result};
use crate::reconnect::ReconnectPolicy;
use crate::session::{ResponseMatching, SessionConfig};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "LOCKERSRV_";

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Controller endpoint
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Status polling
    #[serde(default)]
    pub polling: PollingConfig,

    /// Reconnect behaviour after the link drops
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// On-demand request handling
    #[serde(default)]
    pub session: SessionOptions,

    /// Frame decoding
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Controller (BU) endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Poller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Controller addresses polled round-robin
    #[serde(default = "default_addresses")]
    pub addresses: Vec<u8>,

    /// Delay between two polls in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

/// Reconnect configuration
///
/// Defaults reproduce the controller's expected behaviour: retry every 2 s,
/// forever, without growth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,

    /// Cap for exponential backoff (ignored when multiplier is 1.0)
    #[serde(default = "default_reconnect_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// 0 = unlimited
    #[serde(default)]
    pub max_attempts: u32,

    #[serde(default)]
    pub jitter: bool,
}

/// On-demand request options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Give up waiting for an unlock response after this many milliseconds
    #[serde(default)]
    pub unlock_timeout_ms: Option<u64>,

    #[serde(default)]
    pub response_matching: ResponseMatching,
}

/// Decoder configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Drop status frames whose checksum does not match
    #[serde(default)]
    pub strict_checksum: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Console logging
    #[serde(default = "default_true")]
    pub console: bool,

    /// Directory for daily rolling log files; no file logging when unset
    pub file_dir: Option<String>,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4001
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_addresses() -> Vec<u8> {
    vec![0x00, 0x01]
}

fn default_interval_ms() -> u64 {
    500
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_file_prefix() -> String {
    "lockersrv".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            addresses: default_addresses(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_reconnect_delay_ms(),
            max_delay_ms: default_reconnect_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: 0,
            jitter: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console: default_true(),
            file_dir: None,
            file_prefix: default_file_prefix(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.delay_ms)),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        if let Some(path) = path {
            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .ok_or_else(|| LockerError::config("Invalid file extension"))?;

            figment = match extension {
                "json" => figment.merge(Json::file(path)),
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                _ => {
                    return Err(LockerError::config(format!(
                        "Unsupported config format: {}",
                        extension
                    )))
                },
            };
            info!("Loading configuration from {}", path.display());
        }

        let config: AppConfig = figment
            .merge(Env::prefixed(env_prefix).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.controller.host.trim().is_empty() {
            return Err(LockerError::config("controller.host must not be empty"));
        }
        if self.controller.port == 0 {
            return Err(LockerError::config("controller.port must be non-zero"));
        }
        if self.polling.addresses.is_empty() {
            return Err(LockerError::config(
                "polling.addresses must list at least one controller",
            ));
        }
        if self.polling.interval_ms == 0 {
            return Err(LockerError::config("polling.interval_ms must be non-zero"));
        }
        if self.reconnect.delay_ms == 0 {
            return Err(LockerError::config("reconnect.delay_ms must be non-zero"));
        }
        let multiplier = self.reconnect.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(LockerError::config(
                "reconnect.backoff_multiplier must be >= 1.0",
            ));
        }
        if self.session.unlock_timeout_ms == Some(0) {
            return Err(LockerError::config(
                "session.unlock_timeout_ms must be non-zero when set",
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    /// Session parameters derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.controller.host.clone(),
            port: self.controller.port,
            connect_timeout: Duration::from_millis(self.controller.connect_timeout_ms),
            reconnect: self.reconnect.policy(),
            unlock_timeout: self.session.unlock_timeout_ms.map(Duration::from_millis),
            response_matching: self.session.response_matching,
        }
    }
}
