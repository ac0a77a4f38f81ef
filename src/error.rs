//! Session-level error types
//!
//! Each layer has its own error enum (`ConfigError`, `TransportError`,
//! `DecodeError`); [`SessionError`] is what the public session API returns.

use crate::config::ConfigError;
use crate::session::dispatcher::EventKind;
use crate::session::state::{InvalidTransition, SessionState};
use crate::transport::TransportError;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    Connection(#[source] TransportError),

    #[error("Reconnection abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Not connected - current state: {state}")]
    NotConnected { state: SessionState },

    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),

    #[error("{} observer(s) failed", .0.len())]
    Observer(Vec<ObserverError>),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),
}

impl SessionError {
    /// Observer failures, if this error carries any
    pub fn observer_failures(&self) -> &[ObserverError] {
        match self {
            SessionError::Observer(failures) => failures,
            _ => &[],
        }
    }

    /// Merge the outcomes of two steps of one call, keeping every observer
    /// failure. Any other error takes precedence over observer failures.
    pub(crate) fn combine(first: SessionResult<()>, second: SessionResult<()>) -> SessionResult<()> {
        match (first, second) {
            (Ok(()), other) | (other, Ok(())) => other,
            (Err(SessionError::Observer(mut a)), Err(SessionError::Observer(b))) => {
                a.extend(b);
                Err(SessionError::Observer(a))
            }
            (Err(SessionError::Observer(_)), Err(other)) | (Err(other), Err(_)) => Err(other),
        }
    }
}

/// A single observer that returned an error during an emit pass
#[derive(Debug, Error)]
#[error("{event} observer #{index} failed: {source}")]
pub struct ObserverError {
    pub event: EventKind,
    /// Position of the observer in the snapshot it ran from
    pub index: usize,
    #[source]
    pub source: BoxError,
}

pub type SessionResult<T> = Result<T, SessionError>;
