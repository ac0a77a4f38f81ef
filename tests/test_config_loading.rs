//! Configuration file loading and validation

use losant_mqtt::config::{ConfigError, DeviceConfig, TransportKind};
use losant_mqtt::session::BackoffStrategy;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{contents}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_from_file() {
    let temp_file = write_config(
        r#"
[device]
id = "575ecf887ae143cd83dc4aa2"
access_key_env = "MY_KEY"
access_secret_env = "MY_SECRET"

[connection]
transport = "websockets"
keep_alive_secs = 60

[reconnect]
strategy = "pattern"
pattern_ms = [1000, 2000, 5000]
"#,
    );

    let config = DeviceConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.id, "575ecf887ae143cd83dc4aa2");
    assert_eq!(config.device.access_key_env, "MY_KEY");

    let connection = config.connection_config().unwrap();
    assert!(connection.secure);
    assert_eq!(connection.transport, TransportKind::Websockets);
    assert_eq!(connection.broker_address(), "wss://broker.losant.com:443/mqtt");
    assert_eq!(connection.keep_alive, Duration::from_secs(60));
    assert_eq!(
        connection.reconnect.backoff,
        BackoffStrategy::Pattern {
            pattern_ms: vec![1000, 2000, 5000]
        }
    );
    assert_eq!(connection.reconnect.max_attempts, None);
}

#[test]
fn test_missing_file_is_read_error() {
    let result = DeviceConfig::load_from_file(Path::new("/nonexistent/losant/device.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_missing_device_section_is_parse_error() {
    let temp_file = write_config(
        r#"
[connection]
secure = false
"#,
    );
    assert!(matches!(
        DeviceConfig::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_invalid_values_are_rejected_on_load() {
    let cases = [
        (
            "[device]\nid = \"has space\"",
            "device id",
        ),
        (
            "[device]\nid = \"dev\"\n[connection]\ntransport = \"mqtt\"",
            "transport",
        ),
        (
            "[device]\nid = \"dev\"\n[connection]\nbroker_host = \"host:1883\"",
            "broker host",
        ),
        (
            "[device]\nid = \"dev\"\n[reconnect]\nstrategy = \"fixed\"\ndelay_ms = 10\nmax_attempts = 0",
            "max attempts",
        ),
    ];

    for (contents, what) in cases {
        let temp_file = write_config(contents);
        assert!(
            DeviceConfig::load_from_file(temp_file.path()).is_err(),
            "invalid {what} should be rejected"
        );
    }
}

#[test]
fn test_identity_resolves_from_environment() {
    let temp_file = write_config(
        r#"
[device]
id = "dev-1"
access_key_env = "LOSANT_MQTT_CONFIG_TEST_KEY"
access_secret_env = "LOSANT_MQTT_CONFIG_TEST_SECRET"
"#,
    );
    let config = DeviceConfig::load_from_file(temp_file.path()).unwrap();

    std::env::set_var("LOSANT_MQTT_CONFIG_TEST_KEY", "key-from-env");
    std::env::set_var("LOSANT_MQTT_CONFIG_TEST_SECRET", "secret-from-env");
    let identity = config.identity().unwrap();

    assert_eq!(identity.device_id, "dev-1");
    assert_eq!(identity.access_key, "key-from-env");
    assert_eq!(identity.access_secret, "secret-from-env");
}

#[test]
fn test_config_round_trips_through_toml() {
    let temp_file = write_config(
        r#"
[device]
id = "dev"

[reconnect]
strategy = "exponential"
initial_ms = 250
max_ms = 10000
multiplier = 1.5
max_attempts = 8
"#,
    );
    let config = DeviceConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = DeviceConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}

#[test]
fn test_reconnect_table_without_strategy() {
    let temp_file = write_config(
        r#"
[device]
id = "dev"

[reconnect]
max_attempts = 10
"#,
    );
    let config = DeviceConfig::load_from_file(temp_file.path()).unwrap();

    let connection = config.connection_config().unwrap();
    assert_eq!(connection.reconnect.backoff, BackoffStrategy::default());
    assert_eq!(connection.reconnect.max_attempts, Some(10));
}
