//! Transport abstraction between the device session and the broker
//!
//! The session never talks to an MQTT client directly. It drives a
//! [`Transport`], which lets tests substitute
//! [`MockTransport`](crate::testing::MockTransport) for the real
//! [`MqttTransport`].

use crate::config::{ConnectionConfig, DeviceIdentity, TransportKind};
use crate::error::BoxError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use rumqttc::QoS;

pub mod mqtt;

pub use mqtt::MqttTransport;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] BoxError),
    #[error("Broker rejected credentials: {0}")]
    CredentialsRejected(String),
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("No connection acknowledgement within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Publishing failed")]
    PublishFailed(#[source] BoxError),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] BoxError),
    #[error("Disconnect failed")]
    DisconnectFailed(#[source] BoxError),
    #[error("Transport not connected")]
    NotConnected,
    #[error("Invalid broker address: {0}")]
    InvalidBrokerAddress(String),
}

impl TransportError {
    /// Fatal errors will fail again with the same settings and must not be
    /// retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::CredentialsRejected(_) | TransportError::InvalidBrokerAddress(_)
        )
    }
}

/// Everything a transport needs to open one connection
#[derive(Clone, PartialEq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: String,
    pub password: String,
    /// Host for TCP, full URL for websockets
    pub broker_address: String,
    pub port: u16,
    pub secure: bool,
    pub transport: TransportKind,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    /// Client id is the device id; username and password are the access
    /// key and secret
    pub fn for_device(identity: &DeviceIdentity, config: &ConnectionConfig) -> Self {
        Self {
            client_id: identity.device_id.clone(),
            username: identity.access_key.clone(),
            password: identity.access_secret.clone(),
            broker_address: config.broker_address(),
            port: config.port(),
            secure: config.secure,
            transport: config.transport,
            keep_alive: config.keep_alive,
            connect_timeout: config.connect_timeout,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .field("broker_address", &self.broker_address)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("transport", &self.transport)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Something that happened on the connection during a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    /// Always the last event of a poll batch
    ConnectionLost { reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a fresh connection, replacing any previous one. Returns once
    /// the broker has acknowledged it.
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError>;

    /// Drive network I/O for at most `timeout`, returning what arrived.
    /// A dropped connection is reported as an event, not an error.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<TransportEvent>, TransportError>;

    /// Close the connection. No-op if not connected.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}
