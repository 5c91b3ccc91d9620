//! Envelope streams over quinn bidirectional streams
//!
//! [`QuicStream`] is a pair of [`QuicSendHalf`] and [`QuicRecvHalf`];
//! splitting just hands the halves out.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use infinitoon_proto::{EnvelopeCodec, Message};
use infinitoon_transport::{
    StreamReceiver, StreamSender, StreamSide, TransportError, TransportResult, TransportStream,
};
use quinn::{RecvStream, SendStream};
use tracing::{trace, warn};

use crate::error;

const READ_CHUNK: usize = 8192;

/// Write side of a QUIC stream
#[derive(Debug)]
pub struct QuicSendHalf {
    inner: SendStream,
    id: u64,
    finished: bool,
}

impl QuicSendHalf {
    async fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.finished {
            return Err(TransportError::StreamClosed);
        }
        self.inner.write_all(data).await.map_err(error::from_write)
    }
}

#[async_trait]
impl StreamSender for QuicSendHalf {
    async fn send_message(&mut self, message: &Message) -> TransportResult<()> {
        let frame = EnvelopeCodec::encode(message)
            .map_err(|e| TransportError::MalformedMessage(e.to_string()))?;
        self.write(&frame).await?;

        trace!(stream = self.id, kind = ?message.message_type, "sent");
        Ok(())
    }

    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()> {
        self.write(data).await
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if std::mem::replace(&mut self.finished, true) {
            return Ok(());
        }
        self.inner.finish().map_err(|_| TransportError::StreamClosed)
    }

    fn stream_id(&self) -> u64 {
        self.id
    }
}

/// Read side of a QUIC stream
#[derive(Debug)]
pub struct QuicRecvHalf {
    inner: RecvStream,
    id: u64,
    ended: bool,
    pending: BytesMut,
}

impl QuicRecvHalf {
    /// Next chunk from the wire; `None` once the peer finished
    async fn fill(&mut self, max: usize) -> TransportResult<Option<Bytes>> {
        if self.ended {
            return Ok(None);
        }

        match self.inner.read_chunk(max, true).await {
            Ok(Some(chunk)) => Ok(Some(chunk.bytes)),
            Ok(None) => {
                self.ended = true;
                Ok(None)
            }
            Err(e) => {
                self.ended = true;
                Err(error::from_read(e))
            }
        }
    }

    async fn next_message(&mut self) -> TransportResult<Option<Message>> {
        loop {
            match EnvelopeCodec::decode(&mut self.pending) {
                Ok(Some(message)) => {
                    trace!(stream = self.id, kind = ?message.message_type, "received");
                    return Ok(Some(message));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(stream = self.id, "Dropping malformed frame: {}", e);
                    EnvelopeCodec::skip_malformed(&mut self.pending);
                    return Err(TransportError::MalformedMessage(e.to_string()));
                }
            }

            match self.fill(READ_CHUNK).await? {
                Some(bytes) => self.pending.extend_from_slice(&bytes),
                None if self.pending.is_empty() => return Ok(None),
                None => {
                    let partial = self.pending.split().len();
                    return Err(TransportError::MalformedMessage(format!(
                        "stream ended inside an envelope ({} bytes buffered)",
                        partial
                    )));
                }
            }
        }
    }

    async fn next_bytes(&mut self, max_size: usize) -> TransportResult<Bytes> {
        if !self.pending.is_empty() {
            let n = max_size.min(self.pending.len());
            return Ok(self.pending.split_to(n).freeze());
        }
        Ok(self.fill(max_size).await?.unwrap_or_default())
    }
}

#[async_trait]
impl StreamReceiver for QuicRecvHalf {
    async fn recv_message(&mut self) -> TransportResult<Option<Message>> {
        self.next_message().await
    }

    fn stream_id(&self) -> u64 {
        self.id
    }
}

/// Bidirectional QUIC stream carrying envelopes
#[derive(Debug)]
pub struct QuicStream {
    send: QuicSendHalf,
    recv: QuicRecvHalf,
    initiator: StreamSide,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        let id = send.id();
        let initiator = match id.initiator() {
            quinn::Side::Client => StreamSide::Client,
            quinn::Side::Server => StreamSide::Server,
        };
        let id = quinn::VarInt::from(id).into_inner();

        Self {
            send: QuicSendHalf {
                inner: send,
                id,
                finished: false,
            },
            recv: QuicRecvHalf {
                inner: recv,
                id,
                ended: false,
                pending: BytesMut::with_capacity(READ_CHUNK),
            },
            initiator,
        }
    }
}

#[async_trait]
impl TransportStream for QuicStream {
    type SendHalf = QuicSendHalf;
    type RecvHalf = QuicRecvHalf;

    async fn send_message(&mut self, message: &Message) -> TransportResult<()> {
        self.send.send_message(message).await
    }

    async fn recv_message(&mut self) -> TransportResult<Option<Message>> {
        self.recv.next_message().await
    }

    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()> {
        self.send.write(data).await
    }

    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes> {
        self.recv.next_bytes(max_size).await
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.send.finish().await
    }

    fn stream_id(&self) -> u64 {
        self.send.id
    }

    fn initiator(&self) -> StreamSide {
        self.initiator
    }

    fn is_closed(&self) -> bool {
        self.send.finished && self.recv.ended
    }

    fn split(self) -> (QuicSendHalf, QuicRecvHalf) {
        (self.send, self.recv)
    }
}
