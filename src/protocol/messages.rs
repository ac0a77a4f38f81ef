//! Payload types for the Losant device protocol
//!
//! State reports travel upstream as `{"data": {...}, "time": <epoch ms>}`.
//! Commands travel downstream as `{"name": ..., "payload": {...}, "time": ...}`
//! where timestamps use the MongoDB extended-JSON `{"$date": "..."}` form.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::io;
use thiserror::Error;

/// Errors raised while decoding an inbound command
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("Unexpected topic: expected {expected}, got {actual}")]
    UnexpectedTopic { expected: String, actual: String },
    #[error("Malformed command payload: {0}")]
    MalformedPayload(String),
}

/// Timestamped snapshot of device state sent to the platform
///
/// # Examples
/// ```
/// use losant_mqtt::protocol::StateReport;
/// use chrono::{TimeZone, Utc};
/// use serde_json::json;
///
/// let data = json!({"one": "two"}).as_object().cloned().unwrap();
/// let time = Utc.timestamp_millis_opt(1234).unwrap();
/// let report = StateReport::at(data, time);
///
/// assert_eq!(
///     report.to_payload(),
///     br#"{"data": {"one": "two"}, "time": 1234}"#.to_vec()
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateReport {
    pub data: Map<String, Value>,
    /// Serialized as integer milliseconds since the Unix epoch
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
}

impl StateReport {
    /// Report stamped with the current time
    pub fn now(data: Map<String, Value>) -> Self {
        Self::at(data, Utc::now())
    }

    pub fn at(data: Map<String, Value>, time: DateTime<Utc>) -> Self {
        Self { data, time }
    }

    /// Encode for the state topic.
    ///
    /// Keys are sorted at every level and separators follow the platform's
    /// reference client (`", "` and `": "`, non-ASCII escaped), so payloads
    /// are byte-identical to what that client produces.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut envelope = Map::new();
        envelope.insert("data".to_string(), Value::Object(self.data.clone()));
        envelope.insert(
            "time".to_string(),
            Value::from(self.time.timestamp_millis()),
        );
        to_reference_json(&Value::Object(envelope))
    }
}

/// Named instruction sent from the platform to the device
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub payload: Map<String, Value>,
    pub time: DateTime<Utc>,
}

impl Command {
    pub fn new(name: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            payload,
            time: Utc::now(),
        }
    }

    /// Decode a command payload as delivered on the command topic.
    ///
    /// A missing `time` is filled with the arrival time; a missing or null
    /// `payload` becomes an empty map.
    pub fn from_payload(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::MalformedPayload("empty payload".to_string()));
        }

        let raw: Value = serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;
        let Value::Object(mut fields) = raw else {
            return Err(DecodeError::MalformedPayload(
                "command must be a JSON object".to_string(),
            ));
        };

        let name = match fields.remove("name") {
            Some(Value::String(name)) => name,
            Some(_) => {
                return Err(DecodeError::MalformedPayload(
                    "command name must be a string".to_string(),
                ))
            }
            None => {
                return Err(DecodeError::MalformedPayload(
                    "command name is missing".to_string(),
                ))
            }
        };

        let payload = match fields.remove("payload").map(decode_extended_json).transpose()? {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                return Err(DecodeError::MalformedPayload(format!(
                    "command payload must be an object, got {other}"
                )))
            }
        };

        let time = match fields.remove("time") {
            Some(Value::Null) | None => Utc::now(),
            Some(value) => parse_command_time(&value)?,
        };

        Ok(Self {
            name,
            payload,
            time,
        })
    }

    /// Encode in the platform's downstream format (used by tooling and tests)
    pub fn to_payload(&self) -> Vec<u8> {
        let mut envelope = Map::new();
        envelope.insert("name".to_string(), Value::String(self.name.clone()));
        envelope.insert("payload".to_string(), Value::Object(self.payload.clone()));
        envelope.insert("time".to_string(), extended_date(&self.time));
        to_reference_json(&Value::Object(envelope))
    }
}

fn extended_date(time: &DateTime<Utc>) -> Value {
    let mut date = Map::new();
    date.insert(
        "$date".to_string(),
        Value::String(time.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Value::Object(date)
}

fn parse_command_time(value: &Value) -> Result<DateTime<Utc>, DecodeError> {
    match value {
        Value::Object(map) => match map.get("$date") {
            Some(date) => parse_date_value(date),
            None => Err(DecodeError::MalformedPayload(
                "command time object has no $date".to_string(),
            )),
        },
        other => parse_date_value(other),
    }
}

fn parse_date_value(value: &Value) -> Result<DateTime<Utc>, DecodeError> {
    match value {
        Value::String(text) => parse_extended_date(text),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .ok_or_else(|| DecodeError::MalformedPayload(format!("invalid epoch time: {n}"))),
        other => Err(DecodeError::MalformedPayload(format!(
            "unsupported time value: {other}"
        ))),
    }
}

/// Parse an extended-JSON `$date` string.
///
/// Accepts `Z`, `+HH:MM`, `+HHMM`, `+HH` or no offset (UTC) after a
/// `YYYY-MM-DDTHH:MM:SS[.fff]` body.
pub fn parse_extended_date(text: &str) -> Result<DateTime<Utc>, DecodeError> {
    let malformed = || DecodeError::MalformedPayload(format!("invalid $date value: {text}"));
    let bytes = text.as_bytes();
    let len = bytes.len();
    let is_sign = |b: u8| b == b'+' || b == b'-';

    let (body, offset) = if text.ends_with('Z') {
        (&text[..len - 1], "")
    } else if len >= 6 && bytes[len - 3] == b':' && is_sign(bytes[len - 6]) {
        text.split_at(len - 6)
    } else if len >= 5 && is_sign(bytes[len - 5]) {
        text.split_at(len - 5)
    } else if len >= 3 && is_sign(bytes[len - 3]) {
        text.split_at(len - 3)
    } else {
        (text, "")
    };

    let naive =
        NaiveDateTime::parse_from_str(body, "%Y-%m-%dT%H:%M:%S%.f").map_err(|_| malformed())?;

    let offset_secs = if offset.is_empty() {
        0
    } else {
        let digits = offset[1..].replace(':', "");
        let hours: i64 = digits.get(..2).and_then(|h| h.parse().ok()).ok_or_else(malformed)?;
        let minutes: i64 = match digits.get(2..) {
            Some("") | None => 0,
            Some(m) => m.parse().map_err(|_| malformed())?,
        };
        let secs = hours * 3600 + minutes * 60;
        if offset.starts_with('-') {
            -secs
        } else {
            secs
        }
    };

    Ok(Utc.from_utc_datetime(&naive) - chrono::Duration::seconds(offset_secs))
}

/// Recursively resolve `$date` and `$undefined` extended-JSON values
pub fn decode_extended_json(value: Value) -> Result<Value, DecodeError> {
    match value {
        Value::Object(map) => {
            if let Some(date) = map.get("$date") {
                let time = parse_date_value(date)?;
                return Ok(Value::String(
                    time.to_rfc3339_opts(SecondsFormat::Millis, true),
                ));
            }
            if map.contains_key("$undefined") {
                return Ok(Value::Null);
            }
            map.into_iter()
                .map(|(k, v)| decode_extended_json(v).map(|v| (k, v)))
                .collect::<Result<Map<_, _>, _>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .into_iter()
            .map(decode_extended_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

/// Serialize with sorted keys and the reference client's separators
fn to_reference_json(value: &Value) -> Vec<u8> {
    let sorted = sort_keys(value);
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, ReferenceFormatter);
    // Serializing a Value into a Vec cannot fail
    let _ = sorted.serialize(&mut serializer);
    out
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

struct ReferenceFormatter;

impl serde_json::ser::Formatter for ReferenceFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}
