//! Scriptable in-memory transport
//!
//! Clones share state, so a test keeps one clone to script inbound traffic
//! and inspect what the session published while the session owns another.

use crate::protocol::{Command, TopicRouter};
use crate::transport::{ConnectOptions, QoS, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub type PublishedMessage = (String, Vec<u8>);

#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    pub connected: Arc<AtomicBool>,
    pub connect_calls: Arc<AtomicUsize>,
    pub disconnect_calls: Arc<AtomicUsize>,
    pub connect_results: Arc<Mutex<VecDeque<Result<(), TransportError>>>>,
    pub inbound: Arc<Mutex<VecDeque<TransportEvent>>>,
    pub subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub last_options: Arc<Mutex<Option<ConnectOptions>>>,
    pub fail_publish: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next `connect` call. Unscripted connects
    /// succeed.
    pub async fn queue_connect_result(&self, result: Result<(), TransportError>) {
        self.connect_results.lock().await.push_back(result);
    }

    pub async fn push_event(&self, event: TransportEvent) {
        self.inbound.lock().await.push_back(event);
    }

    pub async fn push_message(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.push_event(TransportEvent::Message {
            topic: topic.into(),
            payload: payload.into(),
        })
        .await;
    }

    /// Deliver a command on the device's command topic
    pub async fn push_command(&self, device_id: &str, command: &Command) {
        self.push_message(TopicRouter::build_command_topic(device_id), command.to_payload())
            .await;
    }

    pub async fn drop_connection(&self, reason: impl Into<String>) {
        self.push_event(TransportEvent::ConnectionLost {
            reason: reason.into(),
        })
        .await;
    }

    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    pub async fn get_published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published_messages
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub async fn get_subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn get_last_options(&self) -> Option<ConnectOptions> {
        self.last_options.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
        self.subscriptions.lock().await.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().await = Some(options.clone());

        let result = self.connect_results.lock().await.pop_front().unwrap_or(Ok(()));
        self.connected.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.subscriptions.lock().await.push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed("Mock publish failure".into()));
        }
        self.published_messages
            .lock()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }

    /// Hands out queued events up to and including the next connection loss
    async fn poll(&mut self, _timeout: Duration) -> Result<Vec<TransportEvent>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut events = Vec::new();
        {
            let mut inbound = self.inbound.lock().await;
            while let Some(event) = inbound.pop_front() {
                let lost = matches!(event, TransportEvent::ConnectionLost { .. });
                events.push(event);
                if lost {
                    self.connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        if events.is_empty() {
            tokio::task::yield_now().await;
        }
        Ok(events)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
