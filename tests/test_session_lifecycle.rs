//! Session lifecycle tests: connect, send_state, close
//!
//! Tests drive a session over the mock transport and assert on observable
//! outcomes: state, emitted events and what reached the transport.


use chrono::{TimeZone, Utc};
use losant_mqtt::config::ConfigError;
use losant_mqtt::session::{ConnectMode, Device, EventKind, Observer, SessionState};
use losant_mqtt::transport::{QoS, TransportError};
use losant_mqtt::{SessionError, TransportKind};
use serde_json::{json, Value};
use std::time::Duration;
use test_helpers::{mock_session, EventLog, DEVICE_ID};

fn state_data(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().expect("object")
}

#[tokio::test]
async fn test_connect_subscribes_and_emits_connect() {
    let (mut session, transport) = mock_session();
    let log = EventLog::new();
    log.attach(&mut session);

    session.connect(ConnectMode::NonBlocking).await.unwrap();

    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.is_connected());
    assert_eq!(
        transport.get_subscriptions().await,
        vec![(format!("losant/{DEVICE_ID}/command"), QoS::AtMostOnce)]
    );
    assert_eq!(log.entries(), vec!["connect"]);
    assert_eq!(log.count("reconnect"), 0);
}

#[tokio::test]
async fn test_connect_uses_device_credentials() {
    let (mut session, transport) = mock_session();
    session.connect(ConnectMode::NonBlocking).await.unwrap();

    let options = transport.get_last_options().await.unwrap();
    assert_eq!(options.client_id, DEVICE_ID);
    assert_eq!(options.username, "my-access-key");
    assert_eq!(options.password, "my-access-secret");
    assert_eq!(options.broker_address, "broker.losant.com");
    assert_eq!(options.port, 8883);
    assert!(options.secure);
}

#[tokio::test]
async fn test_send_state_publishes_one_report() {
    let (mut session, transport) = mock_session();
    session.connect(ConnectMode::NonBlocking).await.unwrap();

    let time = Utc.timestamp_millis_opt(1_464_743_391_000).unwrap();
    let data = state_data(json!({"temperature": 72}));
    session.send_state(data.clone(), Some(time)).await.unwrap();

    let published = transport
        .get_published_to(&format!("losant/{DEVICE_ID}/state"))
        .await;
    assert_eq!(published.len(), 1);

    let decoded: Value = serde_json::from_slice(&published[0]).unwrap();
    assert_eq!(decoded["data"], Value::Object(data));
    assert_eq!(decoded["time"], json!(1_464_743_391_000i64));
    assert_eq!(transport.get_published_messages().await.len(), 1);
}

#[tokio::test]
async fn test_send_state_defaults_time_to_now() {
    let (mut session, transport) = mock_session();
    session.connect(ConnectMode::NonBlocking).await.unwrap();

    let before = Utc::now().timestamp_millis();
    session
        .send_state(state_data(json!({"on": true})), None)
        .await
        .unwrap();
    let after = Utc::now().timestamp_millis();

    let published = transport.get_published_messages().await;
    let decoded: Value = serde_json::from_slice(&published[0].1).unwrap();
    let time = decoded["time"].as_i64().unwrap();
    assert!(before <= time && time <= after);
}

#[tokio::test]
async fn test_send_state_while_disconnected_is_rejected() {
    let (mut session, transport) = mock_session();

    let result = session
        .send_state(state_data(json!({"temperature": 72})), None)
        .await;

    assert!(matches!(
        result,
        Err(SessionError::NotConnected {
            state: SessionState::Disconnected
        })
    ));
    assert!(transport.get_published_messages().await.is_empty());
}

#[tokio::test]
async fn test_send_state_surfaces_publish_failure() {
    let (mut session, transport) = mock_session();
    session.connect(ConnectMode::NonBlocking).await.unwrap();
    transport.set_publish_failure(true);

    let result = session.send_state(state_data(json!({"a": 1})), None).await;
    assert!(matches!(
        result,
        Err(SessionError::Transport(TransportError::PublishFailed(_)))
    ));
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_double_close_emits_close_once() {
    let (mut session, transport) = mock_session();
    let log = EventLog::new();
    log.attach(&mut session);

    session.connect(ConnectMode::NonBlocking).await.unwrap();
    session.close().await.unwrap();
    session.close().await.unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.is_connected());
    assert_eq!(log.count("close"), 1);
    assert_eq!(transport.disconnect_count(), 1);
}

#[tokio::test]
async fn test_close_before_connect_still_emits_close() {
    let (mut session, transport) = mock_session();
    let log = EventLog::new();
    log.attach(&mut session);

    session.close().await.unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(log.entries(), vec!["close"]);
    assert_eq!(transport.disconnect_count(), 0);
}

#[tokio::test]
async fn test_connect_while_connected_is_ignored() {
    let (mut session, transport) = mock_session();
    let log = EventLog::new();
    log.attach(&mut session);

    session.connect(ConnectMode::NonBlocking).await.unwrap();
    session.connect(ConnectMode::NonBlocking).await.unwrap();

    assert_eq!(transport.connect_count(), 1);
    assert_eq!(log.entries(), vec!["connect"]);
}

#[tokio::test]
async fn test_reconnect_after_close_emits_connect() {
    let (mut session, transport) = mock_session();
    let log = EventLog::new();
    log.attach(&mut session);

    session.connect(ConnectMode::NonBlocking).await.unwrap();
    session.close().await.unwrap();
    session.connect(ConnectMode::NonBlocking).await.unwrap();

    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(log.entries(), vec!["connect", "close", "connect"]);
    assert_eq!(transport.connect_count(), 2);
}

#[tokio::test]
async fn test_failed_connect_returns_error() {
    let (mut session, transport) = mock_session();
    let log = EventLog::new();
    log.attach(&mut session);
    transport
        .queue_connect_result(Err(TransportError::BrokerUnavailable(
            "ServiceUnavailable".into(),
        )))
        .await;

    let result = session.connect(ConnectMode::NonBlocking).await;

    assert!(matches!(
        result,
        Err(SessionError::Connection(TransportError::BrokerUnavailable(_)))
    ));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(log.entries().is_empty());
    assert!(transport.get_subscriptions().await.is_empty());

    // A later attempt may still succeed
    session.connect(ConnectMode::NonBlocking).await.unwrap();
    assert_eq!(log.entries(), vec!["connect"]);
}

#[tokio::test]
async fn test_run_loop_on_inactive_session_is_a_no_op() {
    let (mut session, transport) = mock_session();

    session.run_loop(Duration::from_millis(10)).await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);

    session.connect(ConnectMode::NonBlocking).await.unwrap();
    session.close().await.unwrap();
    session.run_loop(Duration::from_millis(10)).await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn test_close_observer_sees_closed_state() {
    let (mut session, _transport) = mock_session();
    session.add_event_observer(
        EventKind::Close,
        Observer::new(|ctx, _| {
            assert_eq!(ctx.device_id(), DEVICE_ID);
            assert_eq!(ctx.state(), SessionState::Closed);
            assert!(!ctx.is_connected());
            Ok(())
        }),
    );
    session.add_event_observer(
        EventKind::Connect,
        Observer::new(|ctx, _| {
            assert!(ctx.is_connected());
            Ok(())
        }),
    );

    session.connect(ConnectMode::NonBlocking).await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_close_requested_during_connect_closes_session() {
    let (mut session, transport) = mock_session();
    let log = EventLog::new();
    session.add_event_observer(
        EventKind::Connect,
        Observer::new(|ctx, _| {
            ctx.close();
            Ok(())
        }),
    );
    log.attach(&mut session);

    session.connect(ConnectMode::NonBlocking).await.unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(log.entries(), vec!["connect", "close"]);
    assert_eq!(transport.disconnect_count(), 1);
}

#[tokio::test]
async fn test_observer_failure_is_reported_from_connect() {
    let (mut session, _transport) = mock_session();
    let log = EventLog::new();
    session.add_event_observer(
        EventKind::Connect,
        Observer::new(|_, _| Err("observer broke".into())),
    );
    log.attach(&mut session);

    let err = session.connect(ConnectMode::NonBlocking).await.unwrap_err();

    assert_eq!(err.observer_failures().len(), 1);
    assert_eq!(err.observer_failures()[0].event, EventKind::Connect);
    // The failure does not undo the connection or skip later observers
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(log.entries(), vec!["connect"]);
}

#[test]
fn test_device_constructors() {
    let device = Device::new(DEVICE_ID, "key", "secret").unwrap();
    assert_eq!(device.state(), SessionState::Disconnected);
    assert_eq!(device.device_id(), DEVICE_ID);
    assert_eq!(
        device.topics().state_topic(),
        format!("losant/{DEVICE_ID}/state")
    );
    assert_eq!(device.config().port(), 8883);

    let websockets = Device::with_options(DEVICE_ID, "key", "secret", false, "websockets").unwrap();
    assert_eq!(websockets.config().transport, TransportKind::Websockets);
    assert_eq!(websockets.config().port(), 80);
}

#[test]
fn test_device_rejects_unknown_transport() {
    let result = Device::with_options(DEVICE_ID, "key", "secret", true, "carrier-pigeon");
    assert!(matches!(result, Err(ConfigError::UnknownTransport(ref t)) if t == "carrier-pigeon"));
}

#[test]
fn test_device_rejects_invalid_id() {
    assert!(matches!(
        Device::new("bad/id", "key", "secret"),
        Err(ConfigError::InvalidDeviceId(_))
    ));
    assert!(matches!(
        Device::new("", "key", "secret"),
        Err(ConfigError::InvalidDeviceId(_))
    ));
}
