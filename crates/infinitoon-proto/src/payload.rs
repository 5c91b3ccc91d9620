//! Payload encoders and decoders

use crate::messages::{Message, MessageType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload errors
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid message type: expected {expected}, got {actual}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A payload body that can be wrapped into (and unwrapped from) an envelope
///
/// Implementors only name their request/response tags and expose the client
/// id; the JSON body handling is shared. A decoder rejects any envelope whose
/// tag is not the one it expects.
pub trait Payload: Serialize + DeserializeOwned {
    const REQUEST: MessageType;
    const RESPONSE: MessageType;

    fn client_id(&self) -> &str;

    fn set_client_id(&mut self, client_id: String);

    fn encode_request(&self) -> Result<Message, PayloadError> {
        encode(self, Self::REQUEST)
    }

    fn encode_response(&self) -> Result<Message, PayloadError> {
        encode(self, Self::RESPONSE)
    }

    fn decode_request(message: &Message) -> Result<Self, PayloadError> {
        decode(message, Self::REQUEST)
    }

    fn decode_response(message: &Message) -> Result<Self, PayloadError> {
        decode(message, Self::RESPONSE)
    }
}

fn encode<P: Payload>(payload: &P, message_type: MessageType) -> Result<Message, PayloadError> {
    let body = serde_json::to_vec(payload)?;
    Ok(Message::new(message_type, payload.client_id(), body))
}

fn decode<P: Payload>(message: &Message, expected: MessageType) -> Result<P, PayloadError> {
    if message.message_type != expected {
        return Err(PayloadError::InvalidMessageType {
            expected,
            actual: message.message_type,
        });
    }

    let mut payload: P = serde_json::from_slice(&message.payload)?;
    payload.set_client_id(message.client_id.clone());
    Ok(payload)
}

/// Liveness check body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoPayload {
    #[serde(skip)]
    pub client_id: String,

    pub message: String,
}

impl EchoPayload {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            message: "echo".to_string(),
        }
    }
}

impl Payload for EchoPayload {
    const REQUEST: MessageType = MessageType::EchoRequest;
    const RESPONSE: MessageType = MessageType::EchoResponse;

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn set_client_id(&mut self, client_id: String) {
        self.client_id = client_id;
    }
}
