//! Canonical messages and payload coercion.
//!
//! Applications hand publish values to the bridge in several shapes: raw
//! bytes, shared byte buffers, already-built messages, or structured records
//! carrying QoS and retain flags next to the payload. [`coerce`] normalizes
//! all of them into a [`Message`] before anything reaches the client.
//!
//! # Coercion rules
//!
//! | Input | Result |
//! |-------|--------|
//! | `Value::Message(m)` | `m`, unchanged |
//! | `Value::Record` with a `payload` key | payload bytes, `qos` (default 0), `retained` (default false) |
//! | `Value::Bytes` / `Value::Buffer` | payload bytes, QoS 0, not retained |
//! | anything else | `BridgeError::UnsupportedPayloadType` |
//!
//! Text is deliberately not encoded: callers choose their own encoding and
//! pass bytes.

use std::collections::BTreeMap;

use bytes::{Buf, Bytes};
use rumqttc::QoS;

use crate::error::BridgeError;

/// One MQTT payload delivery or publish request.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Vec<u8>,
    qos: QoS,
    retained: bool,
}

impl Message {
    /// Creates a QoS 0, non-retained message.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retained: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn is_retained(&self) -> bool {
        self.retained
    }
}

impl From<rumqttc::Publish> for Message {
    fn from(publish: rumqttc::Publish) -> Self {
        Self {
            payload: publish.payload.to_vec(),
            qos: publish.qos,
            retained: publish.retain,
        }
    }
}

/// An application-supplied publish value prior to coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An already canonical message.
    Message(Message),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// A shared buffer view; coercion never moves its read position.
    Buffer(Bytes),
    Text(String),
    Integer(i64),
    Boolean(bool),
    /// A structured record, e.g. `{payload, qos, retained}`.
    Record(BTreeMap<String, Value>),
}

impl Value {
    /// Builds a record value from `(key, value)` pairs.
    ///
    /// ```ignore
    /// let value = Value::record([
    ///     ("payload", Value::from(vec![0x01, 0x02])),
    ///     ("qos", Value::from(1)),
    ///     ("retained", Value::from(true)),
    /// ]);
    /// ```
    pub fn record<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Message(_) => "message",
            Value::Bytes(_) => "bytes",
            Value::Buffer(_) => "buffer",
            Value::Text(_) => "text",
            Value::Integer(_) => "integer",
            Value::Boolean(_) => "boolean",
            Value::Record(_) => "record",
        }
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        Value::Message(message)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for Value {
    fn from(bytes: [u8; N]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<Bytes> for Value {
    fn from(buffer: Bytes) -> Self {
        Value::Buffer(buffer)
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<i64> for Value {
    fn from(number: i64) -> Self {
        Value::Integer(number)
    }
}

impl From<i32> for Value {
    fn from(number: i32) -> Self {
        Value::Integer(number.into())
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Boolean(flag)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Value::Record(fields)
    }
}

/// Normalizes a publish value into a canonical message.
///
/// # Errors
/// - `UnsupportedPayloadType` if the payload (or the value itself) has no
///   byte representation, or `retained` is not a boolean
/// - `InvalidQos` if a record's `qos` is not 0, 1 or 2
pub fn coerce(value: Value) -> Result<Message, BridgeError> {
    match value {
        Value::Message(message) => Ok(message),
        Value::Record(mut fields) if fields.contains_key("payload") => {
            let qos = match fields.remove("qos") {
                None => QoS::AtMostOnce,
                Some(Value::Integer(level)) => qos_from_level(level)?,
                Some(other) => return Err(BridgeError::UnsupportedPayloadType(other.type_name())),
            };
            let retained = match fields.remove("retained") {
                None => false,
                Some(Value::Boolean(flag)) => flag,
                Some(other) => return Err(BridgeError::UnsupportedPayloadType(other.type_name())),
            };
            let payload = fields
                .remove("payload")
                .map(|payload| to_bytes(&payload))
                .transpose()?
                .unwrap_or_default();

            Ok(Message::new(payload).with_qos(qos).with_retained(retained))
        }
        other => Ok(Message::new(to_bytes(&other)?)),
    }
}

/// Coerces a payload value into a freshly allocated byte vector.
///
/// Buffers are read through a duplicate view, so the caller's buffer keeps
/// its position and remaining length.
pub fn to_bytes(value: &Value) -> Result<Vec<u8>, BridgeError> {
    match value {
        Value::Bytes(bytes) => Ok(bytes.clone()),
        Value::Buffer(buffer) => {
            let mut view = buffer.clone();
            let mut bytes = vec![0u8; view.remaining()];
            view.copy_to_slice(&mut bytes);
            Ok(bytes)
        }
        other => Err(BridgeError::UnsupportedPayloadType(other.type_name())),
    }
}

/// Maps a numeric QoS level onto the protocol enum.
pub fn qos_from_level(level: i64) -> Result<QoS, BridgeError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        _ => Err(BridgeError::InvalidQos(level)),
    }
}
