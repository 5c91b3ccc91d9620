//! Codec for encoding/decoding tunnel envelopes

use crate::messages::Message;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Malformed envelope: {0}")]
    Malformed(serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Envelope codec
///
/// Format: one JSON document per envelope followed by a newline. Decoding
/// is streaming: a buffer may hold a partial envelope or several complete
/// ones, and whitespace between documents is ignored.
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Maximum envelope size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Encode an envelope to bytes
    pub fn encode(msg: &Message) -> Result<Bytes, CodecError> {
        let mut payload = serde_json::to_vec(msg).map_err(CodecError::Serialization)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        payload.push(b'\n');
        Ok(Bytes::from(payload))
    }

    /// Decode an envelope from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete envelope was decoded and
    /// consumed, Ok(None) if more data is needed, Err if the buffered bytes
    /// can never become a valid envelope. On error the buffer is left as is;
    /// callers decide whether to discard it.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let leading = buf
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        buf.advance(leading);

        if buf.is_empty() {
            return Ok(None);
        }

        let mut documents = serde_json::Deserializer::from_slice(&buf[..]).into_iter::<Message>();
        match documents.next() {
            Some(Ok(msg)) => {
                let consumed = documents.byte_offset();
                buf.advance(consumed);
                Ok(Some(msg))
            }
            Some(Err(e)) if e.is_eof() => {
                if buf.len() > Self::MAX_MESSAGE_SIZE {
                    return Err(CodecError::MessageTooLarge(buf.len()));
                }
                Ok(None)
            }
            Some(Err(e)) => Err(CodecError::Malformed(e)),
            None => Ok(None),
        }
    }

    /// Discard a malformed envelope from the front of `buf`
    ///
    /// Drops bytes through the next newline so envelopes queued behind the
    /// bad one are still decoded. Without a newline everything is dropped.
    pub fn skip_malformed(buf: &mut BytesMut) {
        match buf.iter().position(|b| *b == b'\n') {
            Some(end) => buf.advance(end + 1),
            None => buf.clear(),
        }
    }

    /// Try to decode multiple envelopes from buffer
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<Message>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = Self::decode(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }
}
