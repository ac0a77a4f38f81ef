//! `rumqttc`-backed transport
//!
//! Each `connect` builds a fresh client and event loop. The event loop is
//! not spawned; it is driven inline by [`poll`](Transport::poll) so the
//! owning session controls exactly when network I/O happens.
//!
//! Requests never wait on the client's bounded request channel. When it is
//! full, the caller drives the event loop itself until there is room, and
//! anything received meanwhile is buffered for the next `poll`.

use super::connection::{classify_connack, configure_mqtt_options, CLIENT_CHANNEL_CAPACITY};
use super::message_handler::{EventRoute, MessageHandler};
use crate::error::BoxError;
use crate::transport::{ConnectOptions, QoS, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, ConnectionError, Event, EventLoop, Outgoing};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Upper bound on flushing the DISCONNECT packet
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a request may spend waiting for room in the request channel
const REQUEST_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct MqttTransport {
    client: Option<AsyncClient>,
    event_loop: Option<Mutex<EventLoop>>,
    /// Events received while flushing requests, handed out by the next poll
    buffered: Mutex<VecDeque<TransportEvent>>,
    connected: bool,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        match (&self.client, self.connected) {
            (Some(client), true) => Ok(client),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Hand a request to the client without waiting on its channel.
    ///
    /// A full channel is drained by running the event loop here, so a caller
    /// that publishes faster than it polls cannot deadlock itself.
    async fn enqueue<F>(&self, mut request: F) -> Result<(), EnqueueError>
    where
        F: FnMut(&AsyncClient) -> Result<(), ClientError> + Send,
    {
        let client = self.client().map_err(EnqueueError::Transport)?;
        let deadline = Instant::now() + REQUEST_QUEUE_TIMEOUT;

        loop {
            match request(client) {
                Ok(()) => return Ok(()),
                Err(ClientError::TryRequest(_)) if Instant::now() < deadline => {
                    self.flush_requests(deadline).await?;
                }
                Err(e) => return Err(EnqueueError::Client(e)),
            }
        }
    }

    /// Run the event loop once so queued requests reach the network
    async fn flush_requests(&self, deadline: Instant) -> Result<(), EnqueueError> {
        let Some(event_loop) = self.event_loop.as_ref() else {
            return Err(EnqueueError::Transport(TransportError::NotConnected));
        };
        let mut event_loop = event_loop.lock().await;
        let budget = deadline.saturating_duration_since(Instant::now());

        match tokio::time::timeout(budget, event_loop.poll()).await {
            Err(_elapsed) => Ok(()),
            Ok(Ok(event)) => {
                let route = MessageHandler::route_event(&event);
                match MessageHandler::to_transport_event(route) {
                    Some(lost @ TransportEvent::ConnectionLost { .. }) => {
                        self.buffered.lock().await.push_back(lost);
                        Err(EnqueueError::Transport(TransportError::NotConnected))
                    }
                    Some(event) => {
                        self.buffered.lock().await.push_back(event);
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "MQTT event loop error while flushing requests");
                self.buffered
                    .lock()
                    .await
                    .push_back(TransportEvent::ConnectionLost {
                        reason: e.to_string(),
                    });
                Err(EnqueueError::Transport(TransportError::NotConnected))
            }
        }
    }

    /// Drive a fresh event loop until the broker answers the CONNECT
    async fn wait_for_connack(
        event_loop: &mut EventLoop,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                match event_loop.poll().await {
                    Ok(event) => match MessageHandler::route_event(&event) {
                        EventRoute::ConnectionAcknowledged(code) => return classify_connack(code),
                        other => trace!(?other, "Event before CONNACK"),
                    },
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        return classify_connack(code);
                    }
                    Err(e) => return Err(TransportError::ConnectionFailed(Box::new(e))),
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout(timeout)),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TransportError> {
        self.client = None;
        self.event_loop = None;
        self.buffered.get_mut().clear();
        self.connected = false;

        let mqtt_options = configure_mqtt_options(options)?;
        debug!(
            client_id = %options.client_id,
            broker = %options.broker_address,
            port = options.port,
            transport = %options.transport,
            secure = options.secure,
            "Opening MQTT connection"
        );

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, CLIENT_CHANNEL_CAPACITY);
        Self::wait_for_connack(&mut event_loop, options.connect_timeout).await?;

        self.client = Some(client);
        self.event_loop = Some(Mutex::new(event_loop));
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.enqueue(|client| client.try_subscribe(topic, qos))
            .await
            .map_err(|e| e.into_transport(TransportError::SubscriptionFailed))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError> {
        self.enqueue(|client| client.try_publish(topic, qos, false, payload.clone()))
            .await
            .map_err(|e| e.into_transport(TransportError::PublishFailed))
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<TransportEvent>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let Some(event_loop) = self.event_loop.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        let mut events: Vec<TransportEvent> = self.buffered.get_mut().drain(..).collect();
        let mut lost = events
            .iter()
            .any(|event| matches!(event, TransportEvent::ConnectionLost { .. }));
        let mut event_loop = event_loop.lock().await;

        let deadline = Instant::now() + timeout;

        while !lost {
            // Once something has arrived, only drain what is already ready
            let budget = if events.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };

            match tokio::time::timeout(budget, event_loop.poll()).await {
                Err(_elapsed) => break,
                Ok(Ok(event)) => {
                    let route = MessageHandler::route_event(&event);
                    if let EventRoute::InfrastructureEvent(ref packet) = route {
                        trace!(packet = %packet, "MQTT protocol traffic");
                    }
                    if let Some(transport_event) = MessageHandler::to_transport_event(route) {
                        let is_loss = matches!(transport_event, TransportEvent::ConnectionLost { .. });
                        events.push(transport_event);
                        if is_loss {
                            lost = true;
                            break;
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "MQTT event loop error");
                    events.push(TransportEvent::ConnectionLost {
                        reason: e.to_string(),
                    });
                    lost = true;
                    break;
                }
            }
        }

        drop(event_loop);
        if lost {
            self.connected = false;
        }
        Ok(events)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let client = self.client.take();
        let event_loop = self.event_loop.take();
        let was_connected = std::mem::replace(&mut self.connected, false);
        self.buffered.get_mut().clear();

        let (Some(client), Some(event_loop), true) = (client, event_loop, was_connected) else {
            return Ok(());
        };

        // The DISCONNECT request only reaches the broker when the loop runs,
        // which also frees room in the request channel
        let mut event_loop = event_loop.into_inner();
        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            let mut requested = false;
            loop {
                if !requested {
                    match client.try_disconnect() {
                        Ok(()) => requested = true,
                        Err(ClientError::TryRequest(_)) => {}
                        Err(e) => return Err(TransportError::DisconnectFailed(Box::new(e))),
                    }
                }
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(true),
                    Ok(_) => continue,
                    Err(_) => return Ok(false),
                }
            }
        })
        .await;

        match flushed {
            Ok(Ok(true)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Ok(Ok(false)) | Err(_) => {
                debug!("Connection ended before DISCONNECT was flushed");
                Ok(())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Why a request could not be handed to the client
enum EnqueueError {
    Transport(TransportError),
    Client(ClientError),
}

impl EnqueueError {
    fn into_transport(self, wrap: fn(BoxError) -> TransportError) -> TransportError {
        match self {
            EnqueueError::Transport(e) => e,
            EnqueueError::Client(e) => wrap(Box::new(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, DeviceIdentity, TransportKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const COMMAND_TOPIC: &str = "losant/d/command";

    /// Minimal broker: accepts one client, acknowledges its CONNECT, sends one
    /// command and then discards everything it receives
    async fn fake_broker() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let mut publish = vec![0x30, 0x14, 0x00, COMMAND_TOPIC.len() as u8];
            publish.extend_from_slice(COMMAND_TOPIC.as_bytes());
            publish.extend_from_slice(b"{}");
            socket.write_all(&publish).await.unwrap();

            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        port
    }

    fn local_options(port: u16) -> ConnectOptions {
        let mut options = unreachable_options();
        options.connect_timeout = Duration::from_secs(5);
        options.port = port;
        options
    }

    fn unreachable_options() -> ConnectOptions {
        let identity = DeviceIdentity::new("device-1", "key", "secret").unwrap();
        let config = ConnectionConfig {
            secure: false,
            transport: TransportKind::Tcp,
            broker_host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let mut options = ConnectOptions::for_device(&identity, &config);
        // Nothing listens on port 1 locally
        options.port = 1;
        options
    }

    #[tokio::test]
    async fn test_new_transport_is_disconnected() {
        let mut transport = MqttTransport::new();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.publish("t", vec![], QoS::AtMostOnce).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.subscribe("t", QoS::AtMostOnce).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.poll(Duration::from_millis(10)).await,
            Err(TransportError::NotConnected)
        ));
        assert!(transport.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_is_retryable() {
        let mut transport = MqttTransport::new();
        let err = transport.connect(&unreachable_options()).await.unwrap_err();

        assert!(!err.is_fatal(), "unexpected fatal error: {err}");
        assert!(matches!(
            err,
            TransportError::ConnectionFailed(_) | TransportError::ConnectTimeout(_)
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_invalid_websocket_address_is_fatal() {
        let mut options = unreachable_options();
        options.transport = TransportKind::Websockets;

        let mut transport = MqttTransport::new();
        let err = transport.connect(&options).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidBrokerAddress(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_publishing_without_polling_does_not_block() {
        let port = fake_broker().await;
        let mut transport = MqttTransport::new();
        transport.connect(&local_options(port)).await.unwrap();

        for i in 0..(CLIENT_CHANNEL_CAPACITY * 3) {
            let published = tokio::time::timeout(
                Duration::from_secs(3),
                transport.publish("losant/d/state", b"{}".to_vec(), QoS::AtMostOnce),
            )
            .await;
            assert!(
                matches!(published, Ok(Ok(()))),
                "publish #{i} did not complete"
            );
        }
        assert!(transport.is_connected());

        // Messages read while flushing are not lost
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while received.is_empty() && Instant::now() < deadline {
            for event in transport.poll(Duration::from_millis(200)).await.unwrap() {
                if let TransportEvent::Message { topic, payload } = event {
                    received.push((topic, payload));
                }
            }
        }
        assert_eq!(received, vec![(COMMAND_TOPIC.to_string(), b"{}".to_vec())]);

        assert!(transport.disconnect().await.is_ok());
        assert!(!transport.is_connected());
    }
}
