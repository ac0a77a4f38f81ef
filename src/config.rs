//! Device and connection configuration
//!
//! A session is built from two immutable values: the [`DeviceIdentity`] the
//! device authenticates as, and the [`ConnectionConfig`] describing how to
//! reach the broker. Both can be built in code or loaded from a TOML file via
//! [`DeviceConfig`], which keeps secrets out of the file by naming the
//! environment variables that hold them.

use crate::protocol::validate_device_id;
use crate::session::reconnect::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default Losant MQTT broker
pub const DEFAULT_BROKER_HOST: &str = "broker.losant.com";

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("Unknown transport '{0}', expected 'tcp' or 'websockets'")]
    UnknownTransport(String),
    #[error("Invalid broker host: {0}")]
    InvalidBrokerHost(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Credentials a device authenticates with
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub access_key: String,
    pub access_secret: String,
}

impl DeviceIdentity {
    pub fn new(
        device_id: impl Into<String>,
        access_key: impl Into<String>,
        access_secret: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let device_id = device_id.into();
        validate_device_id(&device_id)
            .map_err(|e| ConfigError::InvalidDeviceId(format!("'{device_id}': {e}")))?;

        Ok(Self {
            device_id,
            access_key: access_key.into(),
            access_secret: access_secret.into(),
        })
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("access_key", &self.access_key)
            .field("access_secret", &"***")
            .finish()
    }
}

/// Wire transport used to reach the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Websockets,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Websockets => "websockets",
        }
    }

    /// Broker port for this transport
    pub fn port(&self, secure: bool) -> u16 {
        match (self, secure) {
            (TransportKind::Tcp, false) => 1883,
            (TransportKind::Tcp, true) => 8883,
            (TransportKind::Websockets, false) => 80,
            (TransportKind::Websockets, true) => 443,
        }
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "websockets" => Ok(TransportKind::Websockets),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session reaches the broker. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub secure: bool,
    pub transport: TransportKind,
    pub broker_host: String,
    pub keep_alive: Duration,
    /// Upper bound on waiting for the broker's CONNACK
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            secure: true,
            transport: TransportKind::Tcp,
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            keep_alive: Duration::from_secs(default_keep_alive_secs()),
            connect_timeout: Duration::from_secs(default_connect_timeout_secs()),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn port(&self) -> u16 {
        self.transport.port(self.secure)
    }

    /// Address handed to the MQTT client: a bare host for TCP, a full
    /// `ws://` / `wss://` URL for websockets.
    pub fn broker_address(&self) -> String {
        match self.transport {
            TransportKind::Tcp => self.broker_host.clone(),
            TransportKind::Websockets => {
                let scheme = if self.secure { "wss" } else { "ws" };
                format!("{scheme}://{}:{}/mqtt", self.broker_host, self.port())
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_broker_host(&self.broker_host)?;

        if self.keep_alive < Duration::from_secs(1) {
            return Err(ConfigError::InvalidConfig(
                "keep_alive must be at least 1 second".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }

        self.reconnect.validate().map_err(ConfigError::InvalidConfig)
    }
}

fn validate_broker_host(host: &str) -> Result<(), ConfigError> {
    if host.trim().is_empty() {
        return Err(ConfigError::InvalidBrokerHost("host cannot be empty".to_string()));
    }

    let url = Url::parse(&format!("mqtt://{host}"))
        .map_err(|e| ConfigError::InvalidBrokerHost(format!("'{host}': {e}")))?;

    // Reject anything that smuggles a port, path or credentials into the host
    match url.host_str() {
        Some(parsed)
            if parsed.eq_ignore_ascii_case(host)
                && url.port().is_none()
                && url.path().is_empty() =>
        {
            Ok(())
        }
        _ => Err(ConfigError::InvalidBrokerHost(host.to_string())),
    }
}

/// TOML configuration file for the `losant-device` binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Losant device ID
    pub id: String,
    /// Environment variable containing the access key
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,
    /// Environment variable containing the access secret
    #[serde(default = "default_access_secret_env")]
    pub access_secret_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    #[serde(default = "default_secure")]
    pub secure: bool,
    /// "tcp" or "websockets"
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            secure: default_secure(),
            transport: default_transport(),
            broker_host: default_broker_host(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_access_key_env() -> String {
    "LOSANT_ACCESS_KEY".to_string()
}

fn default_access_secret_env() -> String {
    "LOSANT_ACCESS_SECRET".to_string()
}

fn default_secure() -> bool {
    true
}

fn default_transport() -> String {
    TransportKind::Tcp.as_str().to_string()
}

fn default_broker_host() -> String {
    DEFAULT_BROKER_HOST.to_string()
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl DeviceConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)
            .map_err(|e| ConfigError::InvalidDeviceId(format!("'{}': {e}", self.device.id)))?;
        self.connection_config()?.validate()
    }

    /// Build the connection config, rejecting unknown transports
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        Ok(ConnectionConfig {
            secure: self.connection.secure,
            transport: self.connection.transport.parse()?,
            broker_host: self.connection.broker_host.clone(),
            keep_alive: Duration::from_secs(self.connection.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.connection.connect_timeout_secs),
            reconnect: self.reconnect.clone(),
        })
    }

    /// Resolve credentials from the configured environment variables
    pub fn identity(&self) -> Result<DeviceIdentity, ConfigError> {
        let key = Self::get_env_var_required(&self.device.access_key_env)?;
        let secret = Self::get_env_var_required(&self.device.access_secret_env)?;
        DeviceIdentity::new(self.device.id.clone(), key, secret)
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }
}
