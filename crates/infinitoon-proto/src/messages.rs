//! Envelope types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Envelope type tag
///
/// Request/response pairs per payload kind plus two error signals that have
/// no matching request. New application protocols extend this enum; the
/// envelope shape itself never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "echo_rq")]
    EchoRequest,
    #[serde(rename = "echo_rs")]
    EchoResponse,

    #[serde(rename = "auth_rq")]
    AuthRequest,
    #[serde(rename = "auth_rs")]
    AuthResponse,

    #[serde(rename = "http_rq")]
    HttpRequest,
    #[serde(rename = "http_rs")]
    HttpResponse,

    #[serde(rename = "tcp_rq")]
    TcpRequest,
    #[serde(rename = "tcp_rs")]
    TcpResponse,

    #[serde(rename = "udp_rq")]
    UdpRequest,
    #[serde(rename = "udp_rs")]
    UdpResponse,

    #[serde(rename = "err_stream")]
    ErrStream,
    #[serde(rename = "err_invalid_payload")]
    ErrInvalidPayload,
}

impl MessageType {
    /// Wire name of this tag
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::EchoRequest => "echo_rq",
            MessageType::EchoResponse => "echo_rs",
            MessageType::AuthRequest => "auth_rq",
            MessageType::AuthResponse => "auth_rs",
            MessageType::HttpRequest => "http_rq",
            MessageType::HttpResponse => "http_rs",
            MessageType::TcpRequest => "tcp_rq",
            MessageType::TcpResponse => "tcp_rs",
            MessageType::UdpRequest => "udp_rq",
            MessageType::UdpResponse => "udp_rs",
            MessageType::ErrStream => "err_stream",
            MessageType::ErrInvalidPayload => "err_invalid_payload",
        }
    }

    /// Whether this tag is one of the error signals
    pub fn is_error(&self) -> bool {
        matches!(self, MessageType::ErrStream | MessageType::ErrInvalidPayload)
    }

    /// The response tag paired with a request tag
    pub fn response(&self) -> Option<MessageType> {
        match self {
            MessageType::EchoRequest => Some(MessageType::EchoResponse),
            MessageType::AuthRequest => Some(MessageType::AuthResponse),
            MessageType::HttpRequest => Some(MessageType::HttpResponse),
            MessageType::TcpRequest => Some(MessageType::TcpResponse),
            MessageType::UdpRequest => Some(MessageType::UdpResponse),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed envelope carried on a tunnel stream
///
/// `client_id` is set by the payload encoder, never by the transport.
/// `payload` travels as a base64 string (or `null` when empty) so envelopes
/// stay readable by every other implementation of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,

    #[serde(default)]
    pub client_id: String,

    #[serde(default, with = "base64_payload")]
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: MessageType, client_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            client_id: client_id.into(),
            payload,
        }
    }

    /// In-band answer to a frame that could not be decoded
    ///
    /// `client_id` carries the identifier of the side that opened the stream.
    pub fn invalid_payload(client_id: impl Into<String>) -> Self {
        Self::new(MessageType::ErrInvalidPayload, client_id, Vec::new())
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if payload.is_empty() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&STANDARD.encode(payload))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_wire_names() {
        let json = serde_json::to_string(&MessageType::ErrInvalidPayload).unwrap();
        assert_eq!(json, "\"err_invalid_payload\"");

        let parsed: MessageType = serde_json::from_str("\"tcp_rs\"").unwrap();
        assert_eq!(parsed, MessageType::TcpResponse);
        assert_eq!(parsed.to_string(), "tcp_rs");
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let result = serde_json::from_str::<MessageType>("\"ping\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_response_pairs() {
        assert_eq!(
            MessageType::EchoRequest.response(),
            Some(MessageType::EchoResponse)
        );
        assert_eq!(MessageType::ErrStream.response(), None);
        assert!(MessageType::ErrInvalidPayload.is_error());
        assert!(!MessageType::HttpRequest.is_error());
    }

    #[test]
    fn test_payload_is_base64_on_the_wire() {
        let msg = Message::new(MessageType::EchoRequest, "c1", b"{\"message\":\"echo\"}".to_vec());
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"echo_rq","client_id":"c1","payload":"eyJtZXNzYWdlIjoiZWNobyJ9"}"#
        );
    }

    #[test]
    fn test_empty_payload_is_null() {
        let msg = Message::invalid_payload("server");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"err_invalid_payload","client_id":"server","payload":null}"#
        );

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let parsed: Message = serde_json::from_str(r#"{"type":"echo_rs"}"#).unwrap();
        assert_eq!(parsed.message_type, MessageType::EchoResponse);
        assert!(parsed.client_id.is_empty());
        assert!(parsed.payload.is_empty());
    }
}
