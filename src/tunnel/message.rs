//! Wire vocabulary of the debug tunnel.
//!
//! Every frame is a JSON text message carrying an `operation` discriminator:
//!
//! | operation          | direction      | shape                     |
//! |--------------------|----------------|---------------------------|
//! | `execute`          | relay → local  | [`RequestMessage`]        |
//! | `websocket`        | relay → local  | [`RequestMessage`]        |
//! | `execute-response` | local → relay  | [`ResponseMessage`]       |
//! | `execute-remote`   | local → relay  | [`RemoteRequestMessage`]  |
//! | `execute-remote`   | relay → local  | [`ResponseMessage`]       |
//!
//! Payloads are raw bytes, encoded as standard base64 strings on the wire.
//! Header and query maps may arrive as `null` and decode as empty.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

/// Multi-valued map used for headers and query parameters. Ordered so that
/// query strings are encoded deterministically.
pub type MultiMap = BTreeMap<String, Vec<String>>;

/// Value of the `operation` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Run a proxied HTTP request against the local app.
    Execute,
    /// Reply to an `execute` request.
    ExecuteResponse,
    /// Bridge a websocket session to the local app.
    Websocket,
    /// Call a remote provider (outbound) or its reply (inbound).
    ExecuteRemote,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Execute => "execute",
            Operation::ExecuteResponse => "execute-response",
            Operation::Websocket => "websocket",
            Operation::ExecuteRemote => "execute-remote",
        }
    }

    /// Parse a discriminator. Returns `None` for anything outside the protocol.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execute" => Some(Operation::Execute),
            "execute-response" => Some(Operation::ExecuteResponse),
            "websocket" => Some(Operation::Websocket),
            "execute-remote" => Some(Operation::ExecuteRemote),
            _ => None,
        }
    }
}

/// Read only the discriminator of a raw frame.
///
/// Returns the operation string as sent (possibly empty when absent), so that
/// callers can report unknown values verbatim.
pub fn peek_operation(text: &str) -> Result<String, serde_json::Error> {
    let parsed: serde_json::Value = serde_json::from_str(text)?;
    Ok(parsed["operation"].as_str().unwrap_or("").to_string())
}

/// `execute` and `websocket` envelopes sent by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: String,
    pub operation: Operation,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub route: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub query: MultiMap,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: MultiMap,
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// `execute-response` sent back for an `execute`, and the shape of the
/// relay's reply to an `execute-remote`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: String,
    pub operation: Operation,
    pub status: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: MultiMap,
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl ResponseMessage {
    /// Response synthesized when the local app could not be called.
    pub fn local_failure(id: &str, err: &dyn std::fmt::Display) -> Self {
        Self {
            id: id.to_string(),
            operation: Operation::ExecuteResponse,
            status: 500,
            headers: MultiMap::new(),
            payload: format!("failed to call local app: {err}").into_bytes(),
        }
    }
}

/// Target of an `execute-remote` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub faas_function: String,
    pub url: String,
    pub method: String,
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// `execute-remote` envelope pushed by the local side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRequestMessage {
    pub id: String,
    pub operation: Operation,
    pub request: RemoteCommand,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub query: MultiMap,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Byte payloads as standard base64, `null` meaning empty.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_relay_execute_with_nulls() {
        let text = r#"{"id":"abc","operation":"execute","method":"GET","route":"/hi","query":null,"headers":null,"payload":null}"#;
        let msg: RequestMessage = serde_json::from_str(text).unwrap();
        assert_eq!(msg.operation, Operation::Execute);
        assert!(msg.query.is_empty());
        assert!(msg.headers.is_empty());
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn payload_is_base64_on_the_wire() {
        let msg = ResponseMessage {
            id: "1".into(),
            operation: Operation::ExecuteResponse,
            status: 200,
            headers: MultiMap::new(),
            payload: b"test-payload".to_vec(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["payload"], "dGVzdC1wYXlsb2Fk");
        assert_eq!(value["operation"], "execute-response");
    }

    #[test]
    fn remote_request_uses_flat_headers() {
        let msg = RemoteRequestMessage {
            id: "r1".into(),
            operation: Operation::ExecuteRemote,
            request: RemoteCommand {
                faas_function: "voice".into(),
                url: "http://voice/calls".into(),
                method: "POST".into(),
                payload: vec![],
            },
            headers: HashMap::from([("Accept".to_string(), "*/*".to_string())]),
            query: MultiMap::from([("a".to_string(), vec!["1".to_string()])]),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["operation"], "execute-remote");
        assert_eq!(value["request"]["faas_function"], "voice");
        assert_eq!(value["headers"]["Accept"], "*/*");
        assert_eq!(value["query"]["a"][0], "1");
    }

    #[test]
    fn peek_reports_unknown_operation_verbatim() {
        assert_eq!(peek_operation(r#"{"operation":"bogus"}"#).unwrap(), "bogus");
        assert_eq!(Operation::parse("bogus"), None);
        assert_eq!(peek_operation(r#"{"id":"x"}"#).unwrap(), "");
        assert!(peek_operation("not json").is_err());
    }
}
