//! Message envelopes
//!
//! Requests are JSON objects `{id, type, origin, lang?, ...}`; every response
//! carries the id of its request and a `result`, "ok" unless set otherwise.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use webeid_common::Failure;

/// Message types understood by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Version,
    Sign,
    Cert,
    Auth,
    Readers,
    Connect,
    Apdu,
    Disconnect,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Version => "VERSION",
            MessageType::Sign => "SIGN",
            MessageType::Cert => "CERT",
            MessageType::Auth => "AUTH",
            MessageType::Readers => "READERS",
            MessageType::Connect => "CONNECT",
            MessageType::Apdu => "APDU",
            MessageType::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Failure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "VERSION" => MessageType::Version,
            "SIGN" => MessageType::Sign,
            "CERT" => MessageType::Cert,
            "AUTH" => MessageType::Auth,
            "READERS" => MessageType::Readers,
            "CONNECT" => MessageType::Connect,
            "APDU" => MessageType::Apdu,
            "DISCONNECT" => MessageType::Disconnect,
            other => {
                return Err(Failure::InvalidArgument(format!(
                    "unknown message type {:?}",
                    other
                )))
            }
        })
    }
}

/// A request with its mandatory fields present
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    /// Message type as sent; checked at dispatch
    pub kind: String,
    pub origin: String,
    pub lang: Option<String>,
    fields: Map<String, Value>,
}

impl Request {
    /// Check for `type`, `id` and `origin`
    pub fn parse(message: Map<String, Value>) -> Result<Self, Failure> {
        let required = |name: &str| {
            message
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Failure::InvalidArgument(format!("missing {}", name)))
        };

        Ok(Self {
            kind: required("type")?,
            id: required("id")?,
            origin: required("origin")?,
            lang: message.get("lang").and_then(Value::as_str).map(str::to_string),
            fields: message,
        })
    }

    pub fn optional(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn required(&self, name: &str) -> Result<&str, Failure> {
        self.optional(name)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Failure::InvalidArgument(format!("missing {}", name)))
    }

    /// Hex encoded byte field
    pub fn bytes(&self, name: &str) -> Result<Vec<u8>, Failure> {
        hex::decode(self.required(name)?)
            .map_err(|e| Failure::InvalidArgument(format!("{} is not hex: {}", name, e)))
    }
}

/// Id of a message, when it has a string one
pub fn message_id(message: &Map<String, Value>) -> Option<&str> {
    message.get("id").and_then(Value::as_str)
}

/// Fields of a response, before the envelope is applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response(Map<String, Value>);

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response carrying only the result code of `failure`
    pub fn failure(failure: &Failure) -> Self {
        Self::new().with("result", failure.result_code().as_str())
    }

    /// Message not answering any request
    pub fn unsolicited(kind: MessageType) -> Self {
        Self::new().with("type", kind.as_str())
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Add the request id and the default result
    pub fn envelope(self, id: Option<&str>) -> Map<String, Value> {
        let mut message = self.0;
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            message.insert("id".to_string(), Value::from(id));
        }
        message
            .entry("result")
            .or_insert_with(|| Value::from("ok"));
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_default_result_is_ok() {
        let envelope = Response::new().envelope(Some("42"));
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"id":"42","result":"ok"}"#
        );
    }

    #[test]
    fn test_explicit_result_is_kept() {
        let envelope = Response::failure(&Failure::UserCancelled).envelope(Some("7"));
        assert_eq!(envelope["result"], "user_cancel");
        assert_eq!(envelope["id"], "7");
    }

    #[test]
    fn test_missing_fields() {
        for message in [
            json!({"id": "1", "origin": "https://example.com"}),
            json!({"type": "VERSION", "origin": "https://example.com"}),
            json!({"type": "VERSION", "id": "1"}),
            json!({"type": "VERSION", "id": 1, "origin": "https://example.com"}),
        ] {
            assert!(matches!(
                Request::parse(object(message)),
                Err(Failure::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_fields() {
        let request = Request::parse(object(json!({
            "type": "SIGN",
            "id": "1",
            "origin": "https://example.com",
            "lang": "et",
            "hash": "00ff",
            "cert": "zz",
        })))
        .unwrap();
        assert_eq!(request.kind.parse::<MessageType>().unwrap(), MessageType::Sign);
        assert_eq!(request.lang.as_deref(), Some("et"));
        assert_eq!(request.bytes("hash").unwrap(), vec![0x00, 0xff]);
        assert!(request.bytes("cert").is_err());
        assert!(request.required("nonce").is_err());
    }

    #[test]
    fn test_unknown_type() {
        assert!("FOO".parse::<MessageType>().is_err());
    }
}
