//! MQTT 3.1.1 transport built on `rumqttc`
//!
//! - [`connection`] - pure option building and CONNACK classification
//! - [`message_handler`] - pure event routing
//! - [`client`] - the I/O side, [`MqttTransport`]
//!
//! ```rust,no_run
//! use losant_mqtt::config::{ConnectionConfig, DeviceIdentity};
//! use losant_mqtt::transport::{ConnectOptions, MqttTransport, Transport};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let identity = DeviceIdentity::new("my-device-id", "my-access-key", "my-access-secret")?;
//! let options = ConnectOptions::for_device(&identity, &ConnectionConfig::default());
//!
//! let mut transport = MqttTransport::new();
//! transport.connect(&options).await?;
//! let events = transport.poll(Duration::from_secs(1)).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{classify_connack, configure_mqtt_options};
pub use message_handler::{EventRoute, MessageHandler};
