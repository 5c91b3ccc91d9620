//! Tunnel endpoints
//!
//! Clients dial a relay and keep one primary stream for request/reply
//! exchanges and heartbeats. Servers accept any number of clients, serve every
//! inbound stream with a [`StreamHandler`] and can address a connected client
//! by its remote address. A [`Tunnel`] groups named endpoints so a process
//! starts and stops them together, and [`TunnelCommand`] plugs a tunnel into
//! an `infinitoon-container` supervisor.
//!
//! Endpoints are generic over [`infinitoon_transport::TransportFactory`];
//! [`QuicClient`] and [`QuicServer`] are the production instantiations.

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod handler;
pub mod registry;
pub mod retry;
pub mod server;
pub mod tunnel;

pub use client::{Client, ClientState, TunnelClient};
pub use command::TunnelCommand;
pub use config::{ClientConfig, ServerConfig};
pub use error::TunnelError;
pub use handler::{EchoHandler, Responder, StreamContext, StreamHandler};
pub use registry::ConnectionRegistry;
pub use server::{Server, TunnelServer};
pub use tunnel::{Tunnel, TunnelHandles};

use infinitoon_transport_quic::QuicTransportFactory;

/// Client endpoint over QUIC
pub type QuicClient = Client<QuicTransportFactory>;

/// Server endpoint over QUIC
pub type QuicServer = Server<QuicTransportFactory>;
