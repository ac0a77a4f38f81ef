//! Session lifecycle state machine
//!
//! `Disconnected -> Connecting -> Connected -> Reconnecting -> Connected ...`,
//! with `Closed` reachable from every other state. Transitions are computed
//! by the pure [`next_state`] so the session cannot drift into a state the
//! lifecycle does not allow.

use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        }
    }

    /// Connect requests are ignored in these states
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::Reconnecting
        )
    }

    /// States in which `run_loop` does work
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Reconnecting)
    }

    pub fn can_publish(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Triggers that move the session between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    ConnectionLost,
    ReconnectSucceeded,
    ReconnectAbandoned,
    CloseRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{event:?} is not valid in state {from}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

/// Compute the state that follows `event` in state `from`
pub fn next_state(from: SessionState, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
    use SessionEvent::*;
    use SessionState::*;

    match (from, event) {
        (Disconnected | Closed, ConnectRequested) => Ok(Connecting),
        (Connecting, ConnectSucceeded) => Ok(Connected),
        (Connecting, ConnectFailed) => Ok(Disconnected),
        (Connected, ConnectionLost) => Ok(Reconnecting),
        (Reconnecting, ReconnectSucceeded) => Ok(Connected),
        (Reconnecting, ReconnectAbandoned) => Ok(Disconnected),
        (Disconnected | Connecting | Connected | Reconnecting, CloseRequested) => Ok(Closed),
        _ => Err(InvalidTransition { from, event }),
    }
}

pub fn log_state_transition(device_id: &str, from: SessionState, to: SessionState) {
    match (from, to) {
        (SessionState::Connecting, SessionState::Connected) => {
            info!(device_id, "Connected to broker");
        }
        (SessionState::Connected, SessionState::Reconnecting) => {
            warn!(device_id, "Connection lost, reconnecting");
        }
        (SessionState::Reconnecting, SessionState::Connected) => {
            info!(device_id, "Reconnected to broker");
        }
        (SessionState::Reconnecting, SessionState::Disconnected) => {
            error!(device_id, "Reconnection abandoned");
        }
        (_, SessionState::Closed) => {
            info!(device_id, "Session closed");
        }
        _ => {
            debug!(device_id, "Session state: {} -> {}", from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionEvent::*;
    use SessionState::*;

    const ALL_STATES: [SessionState; 5] = [Disconnected, Connecting, Connected, Reconnecting, Closed];

    #[test]
    fn test_happy_path() {
        let mut state = Disconnected;
        for (event, expected) in [
            (ConnectRequested, Connecting),
            (ConnectSucceeded, Connected),
            (ConnectionLost, Reconnecting),
            (ReconnectSucceeded, Connected),
            (CloseRequested, Closed),
            (ConnectRequested, Connecting),
        ] {
            state = next_state(state, event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_close_reachable_from_every_open_state() {
        for state in ALL_STATES {
            let result = next_state(state, CloseRequested);
            if state == Closed {
                assert!(result.is_err());
            } else {
                assert_eq!(result, Ok(Closed));
            }
        }
    }

    #[test]
    fn test_failures_return_to_disconnected() {
        assert_eq!(next_state(Connecting, ConnectFailed), Ok(Disconnected));
        assert_eq!(next_state(Reconnecting, ReconnectAbandoned), Ok(Disconnected));
    }

    #[test]
    fn test_rejected_transitions() {
        assert_eq!(
            next_state(Connected, ConnectRequested),
            Err(InvalidTransition {
                from: Connected,
                event: ConnectRequested
            })
        );
        assert!(next_state(Disconnected, ConnectionLost).is_err());
        assert!(next_state(Connected, ReconnectSucceeded).is_err());
        assert!(next_state(Closed, ConnectSucceeded).is_err());
    }

    #[test]
    fn test_state_predicates() {
        assert!(Connected.can_publish());
        assert!(!Reconnecting.can_publish());
        assert!(Reconnecting.is_running());
        assert!(!Connecting.is_running());
        assert!(Connecting.is_active());
        assert!(!Closed.is_active());
        assert!(!Disconnected.is_active());
    }
}
