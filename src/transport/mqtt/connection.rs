//! Pure connection setup for the MQTT transport
//!
//! Builds `rumqttc` options from [`ConnectOptions`] and classifies the
//! broker's CONNACK. Nothing here touches the network.

use crate::transport::{ConnectOptions, TransportError};
use crate::config::TransportKind;
use rumqttc::{ConnectReturnCode, MqttOptions, Transport as RumqttcTransport};
use url::Url;

/// Request channel capacity of the async client
pub const CLIENT_CHANNEL_CAPACITY: usize = 10;

/// Build MQTT options for one connection attempt
pub fn configure_mqtt_options(options: &ConnectOptions) -> Result<MqttOptions, TransportError> {
    if options.transport == TransportKind::Websockets {
        // rumqttc takes the websocket URL as the host; make sure it is one
        let url = Url::parse(&options.broker_address)
            .map_err(|_| TransportError::InvalidBrokerAddress(options.broker_address.clone()))?;
        if !matches!(url.scheme(), "ws" | "wss") || url.host_str().is_none() {
            return Err(TransportError::InvalidBrokerAddress(
                options.broker_address.clone(),
            ));
        }
    }

    let mut mqtt_options = MqttOptions::new(
        options.client_id.clone(),
        options.broker_address.clone(),
        options.port,
    );
    mqtt_options.set_credentials(options.username.clone(), options.password.clone());
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(true);

    let transport = match (options.transport, options.secure) {
        (TransportKind::Tcp, false) => RumqttcTransport::tcp(),
        (TransportKind::Tcp, true) => RumqttcTransport::tls_with_default_config(),
        (TransportKind::Websockets, false) => RumqttcTransport::ws(),
        (TransportKind::Websockets, true) => RumqttcTransport::wss_with_default_config(),
    };
    mqtt_options.set_transport(transport);

    Ok(mqtt_options)
}

/// Map a CONNACK return code to the connect outcome.
///
/// Server unavailable is worth retrying; every other refusal means the
/// device's identity or credentials are wrong.
pub fn classify_connack(code: ConnectReturnCode) -> Result<(), TransportError> {
    match code {
        ConnectReturnCode::Success => Ok(()),
        ConnectReturnCode::ServiceUnavailable => {
            Err(TransportError::BrokerUnavailable(format!("{code:?}")))
        }
        refused => Err(TransportError::CredentialsRejected(format!("{refused:?}"))),
    }
}
