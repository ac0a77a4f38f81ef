//! Named-event observer registry
//!
//! Observers are registered per [`EventKind`] and invoked in registration
//! order. Each emit iterates a snapshot of the list taken when the pass
//! starts, so an observer may add or remove observers (itself included)
//! without affecting the pass in progress.

use super::close::CloseHandle;
use super::state::SessionState;
use crate::error::{BoxError, ObserverError};
use crate::protocol::Command;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Session events observers can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Reconnect,
    Close,
    Command,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Reconnect => "reconnect",
            EventKind::Close => "close",
            EventKind::Command => "command",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown event '{0}', expected connect, reconnect, close or command")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(EventKind::Connect),
            "reconnect" => Ok(EventKind::Reconnect),
            "close" => Ok(EventKind::Close),
            "command" => Ok(EventKind::Command),
            other => Err(UnknownEventKind(other.to_string())),
        }
    }
}

/// Event delivered to observers
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connect,
    Reconnect,
    Close,
    Command(Command),
}

impl DeviceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DeviceEvent::Connect => EventKind::Connect,
            DeviceEvent::Reconnect => EventKind::Reconnect,
            DeviceEvent::Close => EventKind::Close,
            DeviceEvent::Command(_) => EventKind::Command,
        }
    }
}

pub type ObserverResult = Result<(), BoxError>;

type ObserverFn = dyn Fn(&mut ObserverContext<'_>, &DeviceEvent) -> ObserverResult + Send + Sync;

/// Shared handle to an observer callback.
///
/// Identity is the allocation: clones compare equal, two handles wrapping
/// identical closures do not.
#[derive(Clone)]
pub struct Observer(Arc<ObserverFn>);

impl Observer {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&mut ObserverContext<'_>, &DeviceEvent) -> ObserverResult + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    fn invoke(&self, ctx: &mut ObserverContext<'_>, event: &DeviceEvent) -> ObserverResult {
        (self.0)(ctx, event)
    }
}

impl PartialEq for Observer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Observer {}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Observer({:p})", Arc::as_ptr(&self.0))
    }
}

/// What an observer may touch while it runs
pub struct ObserverContext<'a> {
    device_id: &'a str,
    state: SessionState,
    registry: &'a mut EventDispatcher,
    close: &'a CloseHandle,
}

impl<'a> ObserverContext<'a> {
    pub fn device_id(&self) -> &str {
        self.device_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Takes effect from the next emit pass
    pub fn add_event_observer(&mut self, kind: EventKind, observer: Observer) {
        self.registry.add_observer(kind, observer);
    }

    /// Takes effect from the next emit pass
    pub fn remove_event_observer(&mut self, kind: EventKind, observer: &Observer) -> bool {
        self.registry.remove_observer(kind, observer)
    }

    /// Ask the session to close once the current emit pass finishes
    pub fn close(&self) {
        self.close.close();
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }
}

#[derive(Debug, Default)]
pub struct EventDispatcher {
    observers: HashMap<EventKind, Vec<Observer>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer. The same observer may be registered twice and is
    /// then invoked twice.
    pub fn add_observer(&mut self, kind: EventKind, observer: Observer) {
        self.observers.entry(kind).or_default().push(observer);
    }

    /// Remove the first registration of `observer`; false if it was absent
    pub fn remove_observer(&mut self, kind: EventKind, observer: &Observer) -> bool {
        let Some(registered) = self.observers.get_mut(&kind) else {
            return false;
        };
        match registered.iter().position(|candidate| candidate == observer) {
            Some(index) => {
                registered.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn observer_count(&self, kind: EventKind) -> usize {
        self.observers.get(&kind).map_or(0, Vec::len)
    }

    /// Run one emit pass over the observers registered for `event`.
    ///
    /// Every observer in the snapshot runs even if an earlier one fails;
    /// failures are returned together afterwards.
    pub fn emit(
        &mut self,
        device_id: &str,
        state: SessionState,
        close: &CloseHandle,
        event: &DeviceEvent,
    ) -> Result<(), Vec<ObserverError>> {
        let kind = event.kind();
        let snapshot = self.observers.get(&kind).cloned().unwrap_or_default();
        debug!(device_id, event = %kind, observers = snapshot.len(), "Emitting event");

        let mut failures = Vec::new();
        for (index, observer) in snapshot.iter().enumerate() {
            let mut ctx = ObserverContext {
                device_id,
                state,
                registry: &mut *self,
                close,
            };
            if let Err(source) = observer.invoke(&mut ctx, event) {
                warn!(device_id, event = %kind, index, error = %source, "Observer failed");
                failures.push(ObserverError {
                    event: kind,
                    index,
                    source,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}
