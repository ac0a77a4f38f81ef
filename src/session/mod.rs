//! Device session: one device's connection to the platform across reconnects
//!
//! A [`DeviceSession`] owns its transport and is driven entirely by its
//! caller. Nothing is spawned: network I/O, reconnect attempts and observer
//! callbacks all happen inside `connect`, `run_loop` and `close`.
//!
//! # Examples
//!
//! ```rust,no_run
//! use losant_mqtt::session::{ConnectMode, Device, DeviceEvent, EventKind, Observer};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let mut device = Device::new("my-device-id", "my-access-key", "my-access-secret")?;
//!
//! device.add_event_observer(
//!     EventKind::Command,
//!     Observer::new(|_ctx, event| {
//!         if let DeviceEvent::Command(command) = event {
//!             println!("Command received: {}", command.name);
//!         }
//!         Ok(())
//!     }),
//! );
//!
//! device.connect(ConnectMode::NonBlocking).await?;
//! loop {
//!     device.run_loop(Duration::from_secs(1)).await?;
//!     if device.is_connected() {
//!         let state = json!({"temperature": 72}).as_object().cloned().unwrap_or_default();
//!         device.send_state(state, None).await?;
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod close;
pub mod dispatcher;
pub mod reconnect;
pub mod state;

pub use close::CloseHandle;
pub use dispatcher::{
    DeviceEvent, EventDispatcher, EventKind, Observer, ObserverContext, ObserverResult,
    UnknownEventKind,
};
pub use reconnect::{BackoffStrategy, ReconnectDecision, ReconnectPolicy};
pub use state::{SessionEvent, SessionState};

use crate::config::{ConfigError, ConnectionConfig, DeviceConfig, DeviceIdentity};
use crate::error::{SessionError, SessionResult};
use crate::protocol::{DecodeError, StateReport, TopicRouter};
use crate::session_span;
use crate::transport::{ConnectOptions, MqttTransport, QoS, Transport, TransportError, TransportEvent};
use chrono::{DateTime, Utc};
use close::{close_requested, interruptible_sleep};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Default bound on a single `run_loop` call
pub const DEFAULT_LOOP_TIMEOUT: Duration = Duration::from_secs(1);

/// QoS for the command subscription and state publishes
pub const DEFAULT_QOS: QoS = QoS::AtMostOnce;

/// Who drives the session after the initial connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Keep running the loop until the session is closed
    Blocking,
    /// Return once connected; the caller calls `run_loop` periodically
    NonBlocking,
}

/// Progress through the current outage
#[derive(Debug, Default)]
struct ReconnectTracker {
    failed_attempts: u32,
    next_attempt_at: Option<Instant>,
}

/// Session over the real MQTT transport
pub type Device = DeviceSession<MqttTransport>;

impl DeviceSession<MqttTransport> {
    /// Secure TCP session against the default broker
    pub fn new(
        device_id: impl Into<String>,
        access_key: impl Into<String>,
        access_secret: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Self::with_options(device_id, access_key, access_secret, true, "tcp")
    }

    /// `transport_kind` is `"tcp"` or `"websockets"`
    pub fn with_options(
        device_id: impl Into<String>,
        access_key: impl Into<String>,
        access_secret: impl Into<String>,
        secure: bool,
        transport_kind: &str,
    ) -> Result<Self, ConfigError> {
        let config = ConnectionConfig {
            secure,
            transport: transport_kind.parse()?,
            ..Default::default()
        };
        let identity = DeviceIdentity::new(device_id, access_key, access_secret)?;
        Self::with_transport(identity, config, MqttTransport::new())
    }

    /// Session described by a config file, with secrets from the environment
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        Self::with_transport(
            config.identity()?,
            config.connection_config()?,
            MqttTransport::new(),
        )
    }
}

pub struct DeviceSession<T: Transport> {
    identity: DeviceIdentity,
    config: ConnectionConfig,
    router: TopicRouter,
    state: SessionState,
    dispatcher: EventDispatcher,
    transport: T,
    close_handle: CloseHandle,
    close_rx: watch::Receiver<bool>,
    reconnect: ReconnectTracker,
}

impl<T: Transport> DeviceSession<T> {
    pub fn with_transport(
        identity: DeviceIdentity,
        config: ConnectionConfig,
        transport: T,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let router = TopicRouter::new(&identity.device_id)
            .map_err(|e| ConfigError::InvalidDeviceId(format!("'{}': {e}", identity.device_id)))?;
        let (close_handle, close_rx) = CloseHandle::new();

        Ok(Self {
            identity,
            config,
            router,
            state: SessionState::Disconnected,
            dispatcher: EventDispatcher::new(),
            transport,
            close_handle,
            close_rx,
            reconnect: ReconnectTracker::default(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True only while `Connected`; false while reconnecting
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn topics(&self) -> &TopicRouter {
        &self.router
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Handle another task can use to stop this session
    pub fn close_handle(&self) -> CloseHandle {
        self.close_handle.clone()
    }

    pub fn add_event_observer(&mut self, kind: EventKind, observer: Observer) {
        self.dispatcher.add_observer(kind, observer);
    }

    /// Returns false if the observer was not registered for `kind`
    pub fn remove_event_observer(&mut self, kind: EventKind, observer: &Observer) -> bool {
        self.dispatcher.remove_observer(kind, observer)
    }

    /// Connect to the broker and subscribe to the command topic.
    ///
    /// Ignored while a connection is already active. A closed session can be
    /// connected again and emits `connect`, not `reconnect`. With
    /// [`ConnectMode::Blocking`] this keeps running the loop until the
    /// session is closed; observer failures are then logged rather than
    /// returned.
    pub async fn connect(&mut self, mode: ConnectMode) -> SessionResult<()> {
        if self.state.is_active() {
            debug!(device_id = %self.identity.device_id, state = %self.state, "Already connected, ignoring connect");
            return Ok(());
        }

        let span = session_span!(device_id = %self.identity.device_id, operation = "connect");
        let emitted = self.open().instrument(span).await?;

        match mode {
            ConnectMode::NonBlocking => emitted,
            ConnectMode::Blocking => {
                if let Err(e) = emitted {
                    self.log_suppressed(e)?;
                }
                self.run_until_closed().await
            }
        }
    }

    /// Initial connect. The outer result is the connection outcome, the
    /// inner one the outcome of the `connect` emit pass.
    async fn open(&mut self) -> SessionResult<SessionResult<()>> {
        self.close_handle.reset();
        self.reconnect = ReconnectTracker::default();
        self.transition(SessionEvent::ConnectRequested)?;
        info!(
            device_id = %self.identity.device_id,
            broker = %self.config.broker_host,
            transport = %self.config.transport,
            secure = self.config.secure,
            "Connecting to Losant"
        );

        if let Err(e) = self.establish().await {
            self.transition(SessionEvent::ConnectFailed)?;
            error!(device_id = %self.identity.device_id, error = %e, "Connection failed");
            return Err(SessionError::Connection(e));
        }
        self.transition(SessionEvent::ConnectSucceeded)?;

        let emitted = self.emit(DeviceEvent::Connect);
        let closed = self.honour_close_request().await;
        Ok(SessionError::combine(emitted, closed))
    }

    /// One bounded iteration of network processing.
    ///
    /// Delivers `command` events for messages that arrived, and while
    /// reconnecting waits for and performs at most one reconnect attempt.
    /// Does nothing (besides a warning) unless connected or reconnecting.
    pub async fn run_loop(&mut self, timeout: Duration) -> SessionResult<()> {
        match self.state {
            SessionState::Connected | SessionState::Reconnecting
                if self.close_handle.is_requested() =>
            {
                self.close().await
            }
            SessionState::Connected => self.poll_connected(timeout).await,
            SessionState::Reconnecting => self.poll_reconnecting(timeout).await,
            state => {
                warn!(device_id = %self.identity.device_id, %state, "run_loop called on an inactive session");
                Ok(())
            }
        }
    }

    /// Publish a state report. `time` defaults to now.
    pub async fn send_state(
        &mut self,
        data: Map<String, Value>,
        time: Option<DateTime<Utc>>,
    ) -> SessionResult<()> {
        let report = match time {
            Some(time) => StateReport::at(data, time),
            None => StateReport::now(data),
        };
        self.send_report(&report).await
    }

    pub async fn send_report(&mut self, report: &StateReport) -> SessionResult<()> {
        if !self.state.can_publish() {
            return Err(SessionError::NotConnected { state: self.state });
        }

        let topic = self.router.state_topic();
        debug!(device_id = %self.identity.device_id, topic, "Sending state");
        self.transport
            .publish(topic, self.router.encode_state(report), DEFAULT_QOS)
            .await
            .map_err(SessionError::Transport)
    }

    /// Disconnect and emit `close`. Closing a closed session does nothing.
    pub async fn close(&mut self) -> SessionResult<()> {
        if self.state == SessionState::Closed {
            debug!(device_id = %self.identity.device_id, "Session already closed");
            return Ok(());
        }

        // Anything still waiting on the signal should stop
        self.close_handle.close();

        let disconnected = if self.transport.is_connected() {
            self.transport
                .disconnect()
                .await
                .map_err(SessionError::Transport)
        } else {
            Ok(())
        };
        if let Err(ref e) = disconnected {
            warn!(device_id = %self.identity.device_id, error = %e, "Disconnect failed");
        }

        self.transition(SessionEvent::CloseRequested)?;
        self.reconnect = ReconnectTracker::default();

        let emitted = self.emit(DeviceEvent::Close);
        SessionError::combine(disconnected, emitted)
    }

    async fn poll_connected(&mut self, timeout: Duration) -> SessionResult<()> {
        let polled = tokio::select! {
            polled = self.transport.poll(timeout) => Some(polled),
            _ = close_requested(&mut self.close_rx) => None,
        };
        let Some(polled) = polled else {
            return self.close().await;
        };

        let events = match polled {
            Ok(events) => events,
            Err(e) => vec![TransportEvent::ConnectionLost {
                reason: e.to_string(),
            }],
        };

        let mut outcome = Ok(());
        for event in events {
            match event {
                TransportEvent::Message { topic, payload } => {
                    outcome = SessionError::combine(outcome, self.handle_message(&topic, &payload));
                    if self.close_handle.is_requested() {
                        break;
                    }
                }
                TransportEvent::ConnectionLost { reason } => {
                    self.begin_reconnect(&reason)?;
                    break;
                }
                TransportEvent::Connected => {
                    debug!(device_id = %self.identity.device_id, "Broker acknowledged connection");
                }
            }
        }

        let closed = self.honour_close_request().await;
        SessionError::combine(outcome, closed)
    }

    fn handle_message(&mut self, topic: &str, payload: &[u8]) -> SessionResult<()> {
        match self.router.decode_command(topic, payload) {
            Ok(command) => {
                debug!(device_id = %self.identity.device_id, topic, command = %command.name, "Received command");
                self.emit(DeviceEvent::Command(command))
            }
            Err(DecodeError::UnexpectedTopic { .. }) => {
                debug!(device_id = %self.identity.device_id, topic, "Ignoring message on unexpected topic");
                Ok(())
            }
            Err(e) => {
                warn!(device_id = %self.identity.device_id, topic, error = %e, "Dropping malformed command");
                Ok(())
            }
        }
    }

    fn begin_reconnect(&mut self, reason: &str) -> SessionResult<()> {
        warn!(device_id = %self.identity.device_id, reason, "Connection lost");
        self.transition(SessionEvent::ConnectionLost)?;
        self.reconnect = ReconnectTracker::default();
        Ok(())
    }

    async fn poll_reconnecting(&mut self, timeout: Duration) -> SessionResult<()> {
        let delay = match self.config.reconnect.decide(self.reconnect.failed_attempts) {
            ReconnectDecision::Proceed { delay, .. } => delay,
            ReconnectDecision::AbortMaxAttemptsExceeded => {
                let attempts = self.reconnect.failed_attempts;
                self.transition(SessionEvent::ReconnectAbandoned)?;
                error!(device_id = %self.identity.device_id, attempts, "Giving up on reconnecting");
                return Err(SessionError::ReconnectExhausted { attempts });
            }
        };

        let due = *self
            .reconnect
            .next_attempt_at
            .get_or_insert_with(|| Instant::now() + delay);

        let now = Instant::now();
        if due > now {
            let wait = (due - now).min(timeout);
            if !interruptible_sleep(&mut self.close_rx, wait).await {
                return self.close().await;
            }
            if Instant::now() < due {
                return Ok(());
            }
        }

        let attempt = self.reconnect.failed_attempts + 1;
        let span = session_span!(device_id = %self.identity.device_id, operation = "reconnect", attempt);
        let established = self.establish().instrument(span).await;

        match established {
            Ok(()) => {
                self.reconnect = ReconnectTracker::default();
                self.transition(SessionEvent::ReconnectSucceeded)?;
                let emitted = self.emit(DeviceEvent::Reconnect);
                let closed = self.honour_close_request().await;
                SessionError::combine(emitted, closed)
            }
            Err(e) if e.is_fatal() => {
                self.transition(SessionEvent::ReconnectAbandoned)?;
                error!(device_id = %self.identity.device_id, attempt, error = %e, "Reconnect rejected");
                Err(SessionError::Connection(e))
            }
            Err(e) => {
                debug!(device_id = %self.identity.device_id, attempt, error = %e, "Reconnect attempt failed");
                self.reconnect.failed_attempts = attempt;
                self.reconnect.next_attempt_at =
                    match self.config.reconnect.decide(attempt) {
                        ReconnectDecision::Proceed { delay, .. } => Some(Instant::now() + delay),
                        ReconnectDecision::AbortMaxAttemptsExceeded => None,
                    };
                Ok(())
            }
        }
    }

    /// Blocking-mode driver
    async fn run_until_closed(&mut self) -> SessionResult<()> {
        while self.state.is_running() {
            if let Err(e) = self.run_loop(DEFAULT_LOOP_TIMEOUT).await {
                self.log_suppressed(e)?;
            }
        }
        Ok(())
    }

    /// Log observer failures; pass every other error through
    fn log_suppressed(&self, error: SessionError) -> SessionResult<()> {
        match error {
            SessionError::Observer(failures) => {
                for failure in &failures {
                    warn!(device_id = %self.identity.device_id, event = %failure.event, index = failure.index, error = %failure.source, "Observer failed");
                }
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Connect the transport and subscribe to the command topic
    async fn establish(&mut self) -> Result<(), TransportError> {
        let options = ConnectOptions::for_device(&self.identity, &self.config);
        self.transport.connect(&options).await?;

        if let Err(e) = self
            .transport
            .subscribe(self.router.command_topic(), DEFAULT_QOS)
            .await
        {
            if let Err(disconnect_err) = self.transport.disconnect().await {
                debug!(error = %disconnect_err, "Disconnect after failed subscribe also failed");
            }
            return Err(e);
        }

        debug!(device_id = %self.identity.device_id, topic = self.router.command_topic(), "Subscribed to commands");
        Ok(())
    }

    /// Close now if an observer or another task asked for it
    async fn honour_close_request(&mut self) -> SessionResult<()> {
        if self.close_handle.is_requested() && self.state != SessionState::Closed {
            self.close().await
        } else {
            Ok(())
        }
    }

    fn emit(&mut self, event: DeviceEvent) -> SessionResult<()> {
        self.dispatcher
            .emit(
                &self.identity.device_id,
                self.state,
                &self.close_handle,
                &event,
            )
            .map_err(SessionError::Observer)
    }

    fn transition(&mut self, event: SessionEvent) -> SessionResult<()> {
        let next = state::next_state(self.state, event)?;
        state::log_state_transition(&self.identity.device_id, self.state, next);
        self.state = next;
        Ok(())
    }
}
