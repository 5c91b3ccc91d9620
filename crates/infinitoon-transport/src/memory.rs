//! In-process transport
//!
//! Connections are pairs of in-memory endpoints and every stream is a
//! `tokio::io::duplex` pipe, so envelopes go through the same encoding,
//! buffering and close semantics as on a socket. The [`MemoryNetwork`] acts as
//! the address space: listeners bind into it, connectors dial through it, and
//! tests can make the next dials fail to exercise retry paths.

use crate::{
    StreamReceiver, StreamSender, StreamSide, TransportConfig, TransportConnection,
    TransportConnector, TransportError, TransportFactory, TransportListener, TransportResult,
    TransportSecurityConfig, TransportStream,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use infinitoon_proto::{EnvelopeCodec, Message};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const PIPE_CAPACITY: usize = 64 * 1024;
const READ_CHUNK: usize = 8192;

type Registration = (
    mpsc::UnboundedSender<MemoryConnection>,
    mpsc::UnboundedReceiver<MemoryConnection>,
);

/// Shared address space for in-process listeners and connectors
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Debug)]
struct NetworkInner {
    listeners: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<MemoryConnection>>>,
    next_port: AtomicU16,
    next_connection_id: AtomicU64,
    failing_connects: AtomicUsize,
    connect_attempts: AtomicUsize,
}

impl Default for NetworkInner {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(40000),
            next_connection_id: AtomicU64::new(1),
            failing_connects: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` dials fail with a connection error
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Number of dials attempted so far, failed ones included
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    fn ephemeral_addr(&self) -> SocketAddr {
        let port = self.inner.next_port.fetch_add(1, Ordering::SeqCst);
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn bind(
        &self,
        bind_addr: SocketAddr,
    ) -> TransportResult<(SocketAddr, Registration)> {
        let addr = if bind_addr.port() == 0 {
            self.ephemeral_addr()
        } else {
            bind_addr
        };

        let mut listeners = self
            .inner
            .listeners
            .lock()
            .map_err(|_| TransportError::ConnectionError("network lock poisoned".to_string()))?;

        if listeners.get(&addr).is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::BindFailed {
                addr,
                source: std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "address already in use",
                ),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(addr, tx.clone());
        Ok((addr, (tx, rx)))
    }

    /// Remove a binding, unless the address was re-bound by someone else since
    fn unbind(&self, addr: &SocketAddr, registration: &mpsc::UnboundedSender<MemoryConnection>) {
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            if listeners
                .get(addr)
                .is_some_and(|tx| tx.same_channel(registration))
            {
                listeners.remove(addr);
            }
        }
    }

    fn dial(&self, addr: SocketAddr) -> TransportResult<MemoryConnection> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TransportError::ConnectionError(format!(
                "connection refused: {}",
                addr
            )));
        }

        let listener = self
            .inner
            .listeners
            .lock()
            .map_err(|_| TransportError::ConnectionError("network lock poisoned".to_string()))?
            .get(&addr)
            .cloned()
            .ok_or_else(|| {
                TransportError::ConnectionError(format!("connection refused: {}", addr))
            })?;

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let (client, server) = MemoryConnection::pair(id, self.ephemeral_addr(), addr);

        listener.send(server).map_err(|_| {
            TransportError::ConnectionError(format!("connection refused: {}", addr))
        })?;

        Ok(client)
    }
}

/// Configuration for the in-process transport
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    security: TransportSecurityConfig,
}

impl TransportConfig for MemoryConfig {
    fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    fn validate(&self) -> TransportResult<()> {
        Ok(())
    }
}

/// Factory producing listeners and connectors on one [`MemoryNetwork`]
#[derive(Debug, Clone, Default)]
pub struct MemoryTransportFactory {
    network: MemoryNetwork,
}

impl MemoryTransportFactory {
    pub fn new(network: MemoryNetwork) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl TransportFactory for MemoryTransportFactory {
    type Listener = MemoryListener;
    type Connector = MemoryConnector;
    type Connection = MemoryConnection;
    type Config = MemoryConfig;

    fn create_listener(
        &self,
        bind_addr: SocketAddr,
        _config: Arc<Self::Config>,
    ) -> TransportResult<Self::Listener> {
        MemoryListener::bind(self.network.clone(), bind_addr)
    }

    fn create_connector(&self, _config: Arc<Self::Config>) -> TransportResult<Self::Connector> {
        Ok(MemoryConnector {
            network: self.network.clone(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }

    fn is_encrypted(&self) -> bool {
        false
    }
}

/// In-process listener
#[derive(Debug)]
pub struct MemoryListener {
    network: MemoryNetwork,
    addr: SocketAddr,
    registration: mpsc::UnboundedSender<MemoryConnection>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
    closed: CancellationToken,
}

impl MemoryListener {
    pub fn bind(network: MemoryNetwork, bind_addr: SocketAddr) -> TransportResult<Self> {
        let (addr, (registration, incoming)) = network.bind(bind_addr)?;
        debug!("Memory listener bound to {}", addr);

        Ok(Self {
            network,
            addr,
            registration,
            incoming: tokio::sync::Mutex::new(incoming),
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl TransportListener for MemoryListener {
    type Connection = MemoryConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::ListenerClosed),
            conn = incoming.recv() => match conn {
                Some(conn) => {
                    let remote = conn.remote_address();
                    Ok((conn, remote))
                }
                None => Err(TransportError::ListenerClosed),
            },
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.addr)
    }

    async fn close(&self) {
        self.closed.cancel();
        self.network.unbind(&self.addr, &self.registration);
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unbind(&self.addr, &self.registration);
    }
}

/// In-process connector
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection> {
        trace!("Dialing memory server {} ({})", server_name, addr);
        self.network.dial(addr)
    }
}

#[derive(Debug, Clone)]
enum CloseInfo {
    Application {
        side: StreamSide,
        code: u64,
        reason: String,
    },
    IdleTimeout,
}

#[derive(Debug)]
struct ConnectionShared {
    id: u64,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    to_client: mpsc::UnboundedSender<MemoryStream>,
    to_server: mpsc::UnboundedSender<MemoryStream>,
    client_incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryStream>>,
    server_incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryStream>>,
    next_stream_id: AtomicU64,
    close_info: Mutex<Option<CloseInfo>>,
    closed: CancellationToken,
}

impl ConnectionShared {
    /// Error observed by `side` once the connection is closed
    fn close_error(&self, side: StreamSide) -> TransportError {
        let info = self.close_info.lock().ok().and_then(|info| info.clone());
        match info {
            Some(CloseInfo::Application {
                side: closer,
                code,
                reason,
            }) if closer != side => TransportError::ClosedByPeer { code, reason },
            Some(CloseInfo::IdleTimeout) => TransportError::IdleTimeout,
            _ => TransportError::ConnectionError("connection closed locally".to_string()),
        }
    }

    fn closed_by(&self, side: StreamSide) -> bool {
        self.close_info
            .lock()
            .map(|info| {
                matches!(*info, Some(CloseInfo::Application { side: closer, .. }) if closer == side)
            })
            .unwrap_or(false)
    }

    /// Record how the connection ended; the first close wins
    fn end(&self, how: CloseInfo) {
        if let Ok(mut info) = self.close_info.lock() {
            if info.is_none() {
                *info = Some(how);
            }
        }
        self.closed.cancel();
    }
}

/// One end of an in-process connection
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    shared: Arc<ConnectionShared>,
    side: StreamSide,
}

impl MemoryConnection {
    fn pair(id: u64, client_addr: SocketAddr, server_addr: SocketAddr) -> (Self, Self) {
        let (to_client, client_incoming) = mpsc::unbounded_channel();
        let (to_server, server_incoming) = mpsc::unbounded_channel();

        let shared = Arc::new(ConnectionShared {
            id,
            client_addr,
            server_addr,
            to_client,
            to_server,
            client_incoming: tokio::sync::Mutex::new(client_incoming),
            server_incoming: tokio::sync::Mutex::new(server_incoming),
            next_stream_id: AtomicU64::new(0),
            close_info: Mutex::new(None),
            closed: CancellationToken::new(),
        });

        (
            Self {
                shared: shared.clone(),
                side: StreamSide::Client,
            },
            Self {
                shared,
                side: StreamSide::Server,
            },
        )
    }

    /// End the connection as if it had gone silent past its idle timeout
    ///
    /// Both sides observe [`TransportError::IdleTimeout`] from pending and
    /// later operations.
    pub fn expire(&self) {
        self.shared.end(CloseInfo::IdleTimeout);
        debug!("Memory connection mem-{} idle timeout", self.shared.id);
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    type Stream = MemoryStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        if self.shared.closed.is_cancelled() {
            return Err(self.shared.close_error(self.side));
        }

        let stream_id = self.shared.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);

        let peer = match self.side {
            StreamSide::Client => &self.shared.to_server,
            StreamSide::Server => &self.shared.to_client,
        };
        peer.send(MemoryStream::new(
            remote,
            stream_id,
            self.side,
            self.side.opposite(),
            self.shared.clone(),
        ))
        .map_err(|_| TransportError::ConnectionError("peer is gone".to_string()))?;

        trace!("Opened memory stream {}", stream_id);
        Ok(MemoryStream::new(
            local,
            stream_id,
            self.side,
            self.side,
            self.shared.clone(),
        ))
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        let incoming = match self.side {
            StreamSide::Client => &self.shared.client_incoming,
            StreamSide::Server => &self.shared.server_incoming,
        };
        let mut incoming = incoming.lock().await;

        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => {
                if self.shared.closed_by(self.side) {
                    Ok(None)
                } else {
                    Err(self.shared.close_error(self.side))
                }
            }
            stream = incoming.recv() => Ok(stream),
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        self.shared.end(CloseInfo::Application {
            side: self.side,
            code: u64::from(error_code),
            reason: reason.to_string(),
        });
        debug!(
            "Memory connection mem-{} closed: {} (code: {})",
            self.shared.id, reason, error_code
        );
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    fn remote_address(&self) -> SocketAddr {
        match self.side {
            StreamSide::Client => self.shared.server_addr,
            StreamSide::Server => self.shared.client_addr,
        }
    }

    fn connection_id(&self) -> String {
        format!("mem-{}", self.shared.id)
    }
}

impl StreamSide {
    fn opposite(self) -> Self {
        match self {
            StreamSide::Client => StreamSide::Server,
            StreamSide::Server => StreamSide::Client,
        }
    }
}

/// In-process bidirectional stream
#[derive(Debug)]
pub struct MemoryStream {
    send: MemorySendHalf,
    recv: MemoryRecvHalf,
    initiator: StreamSide,
}

impl MemoryStream {
    fn new(
        pipe: DuplexStream,
        stream_id: u64,
        initiator: StreamSide,
        side: StreamSide,
        shared: Arc<ConnectionShared>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(pipe);
        Self {
            send: MemorySendHalf {
                writer,
                stream_id,
                finished: false,
                side,
                shared: shared.clone(),
            },
            recv: MemoryRecvHalf {
                reader,
                stream_id,
                buffer: BytesMut::with_capacity(READ_CHUNK),
                finished: false,
                side,
                shared,
            },
            initiator,
        }
    }
}

#[async_trait]
impl TransportStream for MemoryStream {
    type SendHalf = MemorySendHalf;
    type RecvHalf = MemoryRecvHalf;

    async fn send_message(&mut self, message: &Message) -> TransportResult<()> {
        self.send.send_message(message).await
    }

    async fn recv_message(&mut self) -> TransportResult<Option<Message>> {
        self.recv.recv_message().await
    }

    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()> {
        self.send.send_bytes(data).await
    }

    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes> {
        self.recv.recv_bytes(max_size).await
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.send.finish().await
    }

    fn stream_id(&self) -> u64 {
        self.send.stream_id
    }

    fn initiator(&self) -> StreamSide {
        self.initiator
    }

    fn is_closed(&self) -> bool {
        self.send.finished && self.recv.finished
    }

    fn split(self) -> (Self::SendHalf, Self::RecvHalf) {
        (self.send, self.recv)
    }
}

/// Send half of an in-process stream
#[derive(Debug)]
pub struct MemorySendHalf {
    writer: WriteHalf<DuplexStream>,
    stream_id: u64,
    finished: bool,
    side: StreamSide,
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl StreamSender for MemorySendHalf {
    async fn send_message(&mut self, message: &Message) -> TransportResult<()> {
        let encoded = EnvelopeCodec::encode(message)
            .map_err(|e| TransportError::MalformedMessage(e.to_string()))?;
        self.send_bytes(&encoded).await
    }

    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.finished {
            return Err(TransportError::StreamClosed);
        }
        if self.shared.closed.is_cancelled() {
            return Err(self.shared.close_error(self.side));
        }

        self.writer.write_all(data).await.map_err(|e| {
            if self.shared.closed.is_cancelled() {
                self.shared.close_error(self.side)
            } else {
                TransportError::ConnectionError(e.to_string())
            }
        })
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.writer
            .shutdown()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

/// Receive half of an in-process stream
#[derive(Debug)]
pub struct MemoryRecvHalf {
    reader: ReadHalf<DuplexStream>,
    stream_id: u64,
    buffer: BytesMut,
    finished: bool,
    side: StreamSide,
    shared: Arc<ConnectionShared>,
}

impl MemoryRecvHalf {
    /// Read one chunk into the buffer; Ok(false) on end of stream
    async fn fill(&mut self) -> TransportResult<bool> {
        let closed = self.shared.closed.clone();
        let read = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(self.shared.close_error(self.side)),
            read = self.reader.read_buf(&mut self.buffer) => read,
        };

        match read {
            Ok(0) => {
                self.finished = true;
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(e) => Err(TransportError::ConnectionError(e.to_string())),
        }
    }

    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes> {
        if self.buffer.is_empty() {
            if self.finished {
                return Ok(Bytes::new());
            }
            self.buffer.reserve(READ_CHUNK);
            if !self.fill().await? {
                return Ok(Bytes::new());
            }
        }

        let take = self.buffer.len().min(max_size);
        Ok(self.buffer.split_to(take).freeze())
    }
}

#[async_trait]
impl StreamReceiver for MemoryRecvHalf {
    async fn recv_message(&mut self) -> TransportResult<Option<Message>> {
        loop {
            match EnvelopeCodec::decode(&mut self.buffer) {
                Ok(Some(message)) => {
                    trace!(
                        "Received message on memory stream {}: {:?}",
                        self.stream_id,
                        message
                    );
                    return Ok(Some(message));
                }
                Ok(None) => {}
                Err(e) => {
                    EnvelopeCodec::skip_malformed(&mut self.buffer);
                    return Err(TransportError::MalformedMessage(e.to_string()));
                }
            }

            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                self.buffer.clear();
                return Err(TransportError::MalformedMessage(
                    "incomplete message at end of stream".to_string(),
                ));
            }

            self.buffer.reserve(READ_CHUNK);
            self.fill().await?;
        }
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }
}
