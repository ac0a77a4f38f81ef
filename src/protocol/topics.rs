//! Topic layout and device ID validation for the Losant device protocol
//!
//! Every device talks on exactly two topics, both rooted at [`TOPIC_ROOT`]:
//!
//! - `losant/{device_id}/command` - platform to device (subscribed)
//! - `losant/{device_id}/state` - device to platform (published)

use super::messages::{Command, DecodeError, StateReport};
use thiserror::Error;

/// Fixed namespace every device topic lives under
pub const TOPIC_ROOT: &str = "losant";

pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    // MQTT level separator and wildcards would corrupt the topic layout
    for ch in device_id.chars() {
        if ch == '/' || ch == '+' || ch == '#' || ch.is_whitespace() || ch.is_control() {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for device identities
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
}

/// Derives the fixed topic pair for a single device identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRouter {
    command_topic: String,
    state_topic: String,
}

impl TopicRouter {
    pub fn new(device_id: &str) -> Result<Self, ValidationError> {
        validate_device_id(device_id)?;
        Ok(Self {
            command_topic: Self::build_command_topic(device_id),
            state_topic: Self::build_state_topic(device_id),
        })
    }

    /// Build command topic: `losant/{device_id}/command`
    pub fn build_command_topic(device_id: &str) -> String {
        format!("{TOPIC_ROOT}/{device_id}/command")
    }

    /// Build state topic: `losant/{device_id}/state`
    pub fn build_state_topic(device_id: &str) -> String {
        format!("{TOPIC_ROOT}/{device_id}/state")
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }

    /// True when an inbound topic is this device's command topic
    pub fn is_command_topic(&self, topic: &str) -> bool {
        topic == self.command_topic
    }

    /// Classify and decode an inbound message
    pub fn decode_command(&self, topic: &str, payload: &[u8]) -> Result<Command, DecodeError> {
        if !self.is_command_topic(topic) {
            return Err(DecodeError::UnexpectedTopic {
                expected: self.command_topic.clone(),
                actual: topic.to_string(),
            });
        }
        Command::from_payload(payload)
    }

    pub fn encode_state(&self, report: &StateReport) -> Vec<u8> {
        report.to_payload()
    }

    /// Encode a command the way the platform delivers it
    pub fn encode_command(&self, command: &Command) -> Vec<u8> {
        command.to_payload()
    }
}
