//! Daemon configuration.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use headset_core::{GatewayConfig, ServiceRecord};
use headset_types::{AgFeatures, DeviceAddress, ScoRouting};

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Audio gateway settings.
    pub gateway: GatewaySettings,
    /// Dummy telephony backend settings.
    pub telephony: TelephonyConfig,
    /// Headsets to serve.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use headset_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.gateway.validate());

        let mut seen = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{i}]");
            errors.extend(device.validate(&prefix));

            if let Ok(address) = device.address.parse::<DeviceAddress>()
                && !seen.insert(address)
            {
                errors.push(ValidationError {
                    field: format!("{prefix}.address"),
                    message: format!("duplicate device address '{}'", device.address),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Engine configuration derived from the `[gateway]` and `[server]` sections.
    ///
    /// Call [`validate`](Self::validate) first; an unparsable adapter
    /// address falls back to the wildcard address.
    pub fn gateway_config(&self) -> GatewayConfig {
        let adapter = self
            .gateway
            .adapter
            .as_deref()
            .and_then(|a| a.parse().ok())
            .unwrap_or(DeviceAddress::ANY);
        GatewayConfig {
            adapter,
            sco_routing: self.gateway.sco_routing,
            hfp_enabled: self.gateway.hfp,
            hsp_enabled: self.gateway.hsp,
            disconnect_timeout: Duration::from_millis(self.gateway.disconnect_timeout_ms),
            ring_interval: Duration::from_millis(self.gateway.ring_interval_ms),
            signal_capacity: self.server.signal_buffer,
            ..GatewayConfig::default()
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8094").
    pub bind: String,
    /// Capacity of the signal broadcast channel feeding WebSocket clients.
    pub signal_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8094".to_string(),
            signal_buffer: 100,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        match self.bind.parse::<SocketAddr>() {
            Ok(addr) if addr.port() == 0 => errors.push(ValidationError {
                field: "server.bind".to_string(),
                message: "port cannot be 0".to_string(),
            }),
            Ok(_) => {}
            Err(_) => errors.push(ValidationError {
                field: "server.bind".to_string(),
                message: format!(
                    "invalid bind address '{}': expected format 'ip:port'",
                    self.bind
                ),
            }),
        }
        if self.signal_buffer == 0 {
            errors.push(ValidationError {
                field: "server.signal_buffer".to_string(),
                message: "signal buffer must hold at least one event".to_string(),
            });
        }

        errors
    }
}

/// `[gateway]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Local adapter address.
    pub adapter: Option<String>,
    /// SCO audio routing: `"hci"` or `"pcm"`.
    pub sco_routing: ScoRouting,
    /// Serve the Hands-Free profile.
    pub hfp: bool,
    /// Serve the Headset profile.
    pub hsp: bool,
    /// Idle time before a stream-opened connection is dropped.
    pub disconnect_timeout_ms: u64,
    /// Interval between `RING` repeats.
    pub ring_interval_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            adapter: None,
            sco_routing: ScoRouting::Hci,
            hfp: true,
            hsp: true,
            disconnect_timeout_ms: 3000,
            ring_interval_ms: 3000,
        }
    }
}

impl GatewaySettings {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(adapter) = &self.adapter
            && adapter.parse::<DeviceAddress>().is_err()
        {
            errors.push(ValidationError {
                field: "gateway.adapter".to_string(),
                message: format!("invalid adapter address '{adapter}'"),
            });
        }
        if !self.hfp && !self.hsp {
            errors.push(ValidationError {
                field: "gateway".to_string(),
                message: "at least one of hfp and hsp must be enabled".to_string(),
            });
        }
        for (field, value) in [
            ("gateway.disconnect_timeout_ms", self.disconnect_timeout_ms),
            ("gateway.ring_interval_ms", self.ring_interval_ms),
        ] {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: "interval cannot be 0".to_string(),
                });
            }
        }

        errors
    }
}

/// `[telephony]` section for the dummy backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    /// AG supported features bitmask advertised in `+BRSF`.
    pub features: u32,
    /// Initial response-and-hold state.
    pub response_and_hold: Option<u8>,
    /// Number reported for `AT+CNUM`.
    pub subscriber_number: Option<String>,
    /// Number used by `AT+BLDN` until something is dialed.
    pub last_dialed: Option<String>,
}

impl TelephonyConfig {
    pub fn features(&self) -> AgFeatures {
        AgFeatures::from_bits(self.features)
    }
}

/// Profile a configured headset implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Hfp,
    Hsp,
}

/// A headset the daemon serves.
///
/// The control and audio endpoints are TCP addresses standing in for the
/// RFCOMM and SCO sockets of a real adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bluetooth address of the headset.
    pub address: String,
    /// Friendly alias for the device.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub profile: Profile,
    /// RFCOMM channel advertised by the headset's service record.
    #[serde(default = "default_channel")]
    pub channel: u8,
    /// Register the service record at startup. When false, the first
    /// connect runs service discovery.
    #[serde(default = "default_cached")]
    pub cached: bool,
    /// Endpoint of the control channel.
    pub control: String,
    /// Endpoint of the audio channel.
    #[serde(default)]
    pub audio: Option<String>,
}

/// Highest valid RFCOMM server channel.
pub const MAX_RFCOMM_CHANNEL: u8 = 30;

fn default_channel() -> u8 {
    1
}

fn default_cached() -> bool {
    true
}

impl DeviceConfig {
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.address.parse::<DeviceAddress>().is_err() {
            errors.push(ValidationError {
                field: format!("{prefix}.address"),
                message: format!("invalid Bluetooth address '{}'", self.address),
            });
        }

        if let Some(alias) = &self.alias
            && alias.is_empty()
        {
            errors.push(ValidationError {
                field: format!("{prefix}.alias"),
                message: "alias cannot be empty string (use null/omit instead)".to_string(),
            });
        }

        if !(1..=MAX_RFCOMM_CHANNEL).contains(&self.channel) {
            errors.push(ValidationError {
                field: format!("{prefix}.channel"),
                message: format!(
                    "channel {} is outside 1..={MAX_RFCOMM_CHANNEL}",
                    self.channel
                ),
            });
        }

        for (field, endpoint) in [("control", Some(&self.control)), ("audio", self.audio.as_ref())] {
            if let Some(endpoint) = endpoint
                && endpoint.parse::<SocketAddr>().is_err()
            {
                errors.push(ValidationError {
                    field: format!("{prefix}.{field}"),
                    message: format!("invalid endpoint '{endpoint}': expected 'ip:port'"),
                });
            }
        }

        errors
    }

    /// Service record advertised by this headset. `index` makes the handle unique.
    pub fn record(&self, index: usize) -> ServiceRecord {
        let handle = 0x10000 + u32::try_from(index).unwrap_or(0);
        match self.profile {
            Profile::Hfp => ServiceRecord::handsfree(handle, self.channel),
            Profile::Hsp => ServiceRecord::headset(handle, self.channel),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `devices[0].address`).
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("headset-gateway")
        .join("server.toml")
}
