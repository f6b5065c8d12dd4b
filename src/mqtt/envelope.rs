//! Message model and the JSON envelope codec.
//!
//! In memory a message is MQTT 5-shaped: a payload plus typed properties
//! (ordered user properties, correlation data, response topic). On the wire
//! every broker-visible payload is the JSON envelope
//!
//! ```json
//! {"payload": "...", "properties": {"key": "value", ...}}
//! ```
//!
//! which carries MQTT 5 user properties over MQTT 3 connections. The flat
//! `properties` object holds every user property in order, then
//! `correlation_data` and `response_topic` verbatim when present. The MQTT 5
//! side additionally mirrors the properties natively; the inbound codec
//! merges the native block over the envelope.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Well-known user-property keys stamped or validated by the gateway.
pub mod keys {
    pub const TYPE: &str = "type";
    pub const LABEL: &str = "label";
    pub const METHOD: &str = "method";
    pub const STATUS: &str = "status";
    pub const AGENT_LABEL: &str = "agent_label";
    pub const ACCOUNT_LABEL: &str = "account_label";
    pub const AUDIENCE: &str = "audience";
    pub const CONNECTION_VERSION: &str = "connection_version";
    pub const CONNECTION_MODE: &str = "connection_mode";
    pub const BROKER_AGENT_LABEL: &str = "broker_agent_label";
    pub const BROKER_ACCOUNT_LABEL: &str = "broker_account_label";
    pub const BROKER_AUDIENCE: &str = "broker_audience";
    pub const BROKER_PROCESSING_TIMESTAMP: &str = "broker_processing_timestamp";
    pub const BROKER_INITIAL_PROCESSING_TIMESTAMP: &str = "broker_initial_processing_timestamp";
    pub const TIMESTAMP: &str = "timestamp";
    pub const INITIAL_TIMESTAMP: &str = "initial_timestamp";
    pub const LOCAL_TIMESTAMP: &str = "local_timestamp";
    pub const LOCAL_INITIAL_TIMEDIFF: &str = "local_initial_timediff";
}

/// Keys lifted out of the flat envelope object into their MQTT 5 slots.
const CORRELATION_DATA: &str = "correlation_data";
const RESPONSE_TOPIC: &str = "response_topic";

/// Ordered list of UTF-8 user-property pairs.
///
/// `set` replaces the value of an existing key in place; new keys append.
/// Rewriting therefore preserves the relative order of untouched keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProperties(Vec<(String, String)>);

impl UserProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw key/value byte pairs, validating UTF-8 and rejecting
    /// the reserved slot names.
    pub fn from_bytes<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let mut props = Self::new();
        for (key, value) in pairs {
            let key = String::from_utf8(key)
                .map_err(|_| Error::BadProperties("user-property key is not valid UTF-8".into()))?;
            let value = String::from_utf8(value).map_err(|_| {
                Error::BadProperties(format!("user-property `{key}` value is not valid UTF-8"))
            })?;
            if key == CORRELATION_DATA || key == RESPONSE_TOPIC {
                return Err(Error::BadProperties(format!(
                    "user-property key `{key}` is reserved"
                )));
            }
            props.0.push((key, value));
        }
        Ok(props)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replace the first occurrence of `key` in place, or append.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Typed MQTT 5 property block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub user: UserProperties,
    pub correlation_data: Option<Vec<u8>>,
    pub response_topic: Option<String>,
}

impl Properties {
    /// Merge a native MQTT 5 property block over envelope-derived
    /// properties. Native slots win; native user properties replace same-key
    /// entries in place and append new keys.
    pub fn merge_native(&mut self, native: &Properties) {
        for (key, value) in native.user.iter() {
            self.user.set(key, value);
        }
        if native.correlation_data.is_some() {
            self.correlation_data = native.correlation_data.clone();
        }
        if native.response_topic.is_some() {
            self.response_topic = native.response_topic.clone();
        }
    }
}

/// An in-flight message between parse and emit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub properties: Properties,
}

/// Parse an MQTT 3 payload: the whole message is the JSON envelope.
pub fn parse_v3(payload: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| Error::BadEnvelope(format!("payload is not valid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::BadEnvelope("payload is not a JSON object".into()))?;

    for key in object.keys() {
        if key != "payload" && key != "properties" {
            return Err(Error::BadEnvelope(format!("unexpected envelope key `{key}`")));
        }
    }

    let inner = object
        .get("payload")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::BadEnvelope("envelope `payload` must be a string".into()))?;

    let mut properties = Properties::default();
    if let Some(value) = object.get("properties") {
        let flat = value
            .as_object()
            .ok_or_else(|| Error::BadEnvelope("envelope `properties` must be an object".into()))?;
        for (key, value) in flat {
            let value = value.as_str().ok_or_else(|| {
                Error::BadEnvelope(format!("property `{key}` must be a string"))
            })?;
            match key.as_str() {
                CORRELATION_DATA => {
                    properties.correlation_data = Some(value.as_bytes().to_vec());
                }
                RESPONSE_TOPIC => {
                    properties.response_topic = Some(value.to_owned());
                }
                _ => properties.user.set(key.as_str(), value),
            }
        }
    }

    Ok(Message {
        payload: inner.as_bytes().to_vec(),
        properties,
    })
}

/// Parse an MQTT 5 publish: the envelope from the payload, then the native
/// property block merged over it.
pub fn parse_v5(payload: &[u8], native: &Properties) -> Result<Message> {
    let mut message = parse_v3(payload)?;
    message.properties.merge_native(native);
    Ok(message)
}

/// Emit the MQTT 3 wire form: the full flat envelope.
pub fn emit_v3(message: &Message) -> Result<Vec<u8>> {
    let mut flat = Map::new();
    for (key, value) in message.properties.user.iter() {
        flat.insert(key.to_owned(), Value::String(value.to_owned()));
    }
    if let Some(data) = &message.properties.correlation_data {
        let data = std::str::from_utf8(data)
            .map_err(|_| Error::BadEnvelope("correlation data is not valid UTF-8".into()))?;
        flat.insert(CORRELATION_DATA.to_owned(), Value::String(data.to_owned()));
    }
    if let Some(topic) = &message.properties.response_topic {
        flat.insert(RESPONSE_TOPIC.to_owned(), Value::String(topic.clone()));
    }

    let inner = std::str::from_utf8(&message.payload)
        .map_err(|_| Error::BadEnvelope("payload is not valid UTF-8".into()))?;

    let mut envelope = Map::new();
    envelope.insert("payload".to_owned(), Value::String(inner.to_owned()));
    envelope.insert("properties".to_owned(), Value::Object(flat));

    serde_json::to_vec(&Value::Object(envelope))
        .map_err(|e| Error::BadEnvelope(format!("cannot encode envelope: {e}")))
}

/// Emit the MQTT 5 wire form: the envelope payload plus the native property
/// block mirroring it.
pub fn emit_v5(message: &Message) -> Result<(Vec<u8>, Properties)> {
    Ok((emit_v3(message)?, message.properties.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut properties = Properties::default();
        properties.user.set(keys::TYPE, "event");
        properties.user.set(keys::LABEL, "sensor.reading");
        properties.correlation_data = Some(b"corr-1".to_vec());
        properties.response_topic = Some("agents/a.b.example.net/api/v1/in/c.example.org".into());
        Message {
            payload: b"hello".to_vec(),
            properties,
        }
    }

    #[test]
    fn test_round_trip_v3() {
        let message = sample();
        let wire = emit_v3(&message).unwrap();
        assert_eq!(parse_v3(&wire).unwrap(), message);
    }

    #[test]
    fn test_round_trip_v5() {
        let message = sample();
        let (wire, native) = emit_v5(&message).unwrap();
        assert_eq!(parse_v5(&wire, &native).unwrap(), message);
    }

    #[test]
    fn test_parse_lifts_slots() {
        let wire = br#"{"payload":"hi","properties":{"type":"request","correlation_data":"xyz","response_topic":"a/b"}}"#;
        let message = parse_v3(wire).unwrap();
        assert_eq!(message.payload, b"hi");
        assert_eq!(message.properties.user.get(keys::TYPE), Some("request"));
        assert_eq!(message.properties.correlation_data.as_deref(), Some(&b"xyz"[..]));
        assert_eq!(message.properties.response_topic.as_deref(), Some("a/b"));
        // The slots are not duplicated as user properties.
        assert_eq!(message.properties.user.len(), 1);
    }

    #[test]
    fn test_emit_flat_order() {
        let message = sample();
        let wire = emit_v3(&message).unwrap();
        let value: Value = serde_json::from_slice(&wire).unwrap();
        let flat: Vec<&String> = value["properties"].as_object().unwrap().keys().collect();
        assert_eq!(flat, ["type", "label", "correlation_data", "response_topic"]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let inputs: &[&[u8]] = &[
            b"not json",
            b"[]",
            br#"{"payload":42}"#,
            br#"{"properties":{}}"#,
            br#"{"payload":"x","properties":[]}"#,
            br#"{"payload":"x","properties":{"k":1}}"#,
            br#"{"payload":"x","extra":"y"}"#,
        ];
        for input in inputs {
            assert!(parse_v3(input).is_err());
        }
    }

    #[test]
    fn test_native_block_wins() {
        let wire = br#"{"payload":"hi","properties":{"type":"event","source":"envelope"}}"#;
        let mut native = Properties::default();
        native.user.set("source", "native");
        native.user.set("extra", "1");
        native.correlation_data = Some(b"n".to_vec());

        let message = parse_v5(wire, &native).unwrap();
        assert_eq!(message.properties.user.get("source"), Some("native"));
        assert_eq!(message.properties.user.get("extra"), Some("1"));
        assert_eq!(message.properties.correlation_data.as_deref(), Some(&b"n"[..]));
        // Envelope order is preserved for keys the native block replaced.
        let order: Vec<&str> = message.properties.user.iter().map(|(k, _)| k).collect();
        assert_eq!(order, ["type", "source", "extra"]);
    }

    #[test]
    fn test_from_bytes_validates() {
        let ok = UserProperties::from_bytes([(b"k".to_vec(), b"v".to_vec())]).unwrap();
        assert_eq!(ok.get("k"), Some("v"));

        assert!(UserProperties::from_bytes([(vec![0xff, 0xfe], b"v".to_vec())]).is_err());
        assert!(UserProperties::from_bytes([(b"k".to_vec(), vec![0xff])]).is_err());
        assert!(
            UserProperties::from_bytes([(b"correlation_data".to_vec(), b"v".to_vec())]).is_err()
        );
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut props = UserProperties::new();
        props.set("a", "1");
        props.set("b", "2");
        props.set("a", "3");
        let pairs: Vec<(&str, &str)> = props.iter().collect();
        assert_eq!(pairs, [("a", "3"), ("b", "2")]);
    }

    #[test]
    fn test_emit_requires_utf8() {
        let mut message = sample();
        message.properties.correlation_data = Some(vec![0xff, 0x00]);
        assert!(emit_v3(&message).is_err());

        let mut message = sample();
        message.payload = vec![0x80, 0x81];
        assert!(emit_v3(&message).is_err());
    }
}
