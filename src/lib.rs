//! Losant MQTT device client
//!
//! Connects a device to the Losant IoT platform over MQTT, reports its state
//! and delivers platform commands to registered observers, surviving
//! connection drops through automatic reconnection.
//!
//! # Overview
//!
//! - [`protocol`] - topic layout and payload encoding
//! - [`session`] - the [`Device`] session, its state machine and observers
//! - [`transport`] - the broker connection, behind the [`Transport`] trait
//! - [`config`] - device identity, connection settings, TOML loading
//!
//! # Quick Start
//!
//! ```rust
//! use losant_mqtt::protocol::{StateReport, TopicRouter};
//! use chrono::{TimeZone, Utc};
//! use serde_json::json;
//!
//! let topics = TopicRouter::new("my-device-id").unwrap();
//! assert_eq!(topics.state_topic(), "losant/my-device-id/state");
//!
//! let data = json!({"temperature": 72}).as_object().cloned().unwrap();
//! let report = StateReport::at(data, Utc.timestamp_millis_opt(1_000).unwrap());
//! assert_eq!(
//!     topics.encode_state(&report),
//!     br#"{"data": {"temperature": 72}, "time": 1000}"#.to_vec()
//! );
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ConnectionConfig, DeviceConfig, DeviceIdentity, TransportKind};
pub use error::{ObserverError, SessionError, SessionResult};
pub use protocol::{Command, StateReport, TopicRouter};
pub use session::{
    CloseHandle, ConnectMode, Device, DeviceEvent, DeviceSession, EventKind, Observer,
    ObserverContext, SessionState, DEFAULT_LOOP_TIMEOUT,
};
pub use transport::{MqttTransport, Transport, TransportError};
