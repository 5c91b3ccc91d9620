//! Tunnel envelope protocol
//!
//! Every exchange on a tunnel stream is a [`Message`] envelope: a closed
//! [`MessageType`] tag, the logical client id, and an opaque payload whose
//! shape is chosen by the tag. Envelopes are JSON documents written back to
//! back on a stream, so a reader can pull several of them off the same byte
//! channel without any extra framing header.
//!
//! # Example
//!
//! ```
//! use infinitoon_proto::{EchoPayload, EnvelopeCodec, Payload};
//! use bytes::BytesMut;
//!
//! let request = EchoPayload::new("laptop").encode_request().unwrap();
//! let mut wire = BytesMut::from(&EnvelopeCodec::encode(&request).unwrap()[..]);
//!
//! let decoded = EnvelopeCodec::decode(&mut wire).unwrap().unwrap();
//! let echo = EchoPayload::decode_request(&decoded).unwrap();
//! assert_eq!(echo.client_id, "laptop");
//! ```

pub mod codec;
pub mod messages;
pub mod payload;

pub use codec::{CodecError, EnvelopeCodec};
pub use messages::{Message, MessageType};
pub use payload::{EchoPayload, Payload, PayloadError};
