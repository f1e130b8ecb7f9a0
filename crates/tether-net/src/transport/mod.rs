//! Role-side transport seams and the raw-socket implementation.
//!
//! A transport turns its own connection mechanics (accept loop, relay
//! callbacks) into a stream of [`TransportEvent`]s drained once per tick.
//! Everything above this layer sees only events and [`Connection`]s.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::connection::Connection;
use crate::peer::{HostAddress, PeerId};
use crate::relay::RelayError;

pub mod socket;
mod tcp;
pub mod tcp_client;
pub mod tcp_server;

pub use tcp::TcpConnection;
pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;

/// Something a transport observed since the last poll.
#[derive(Debug)]
pub enum TransportEvent {
    /// Server side: a peer finished connecting.
    PeerConnected(PeerId),
    /// Server side: a peer's connection closed or failed.
    PeerDisconnected { peer: PeerId, reason: String },
    /// Client side: the transport reports a live channel to the host. The
    /// host may not be ready for application data yet.
    HostReachable,
    /// Client side: the channel to the host is gone.
    HostLost(String),
    /// An unrecoverable failure of the role.
    Failed(TransportError),
    /// One complete inbound packet.
    Message { from: PeerId, bytes: Vec<u8> },
}

/// Errors raised while setting up or driving a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Listen socket creation failed.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Outbound connect failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A configured address did not parse.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// The transport cannot reach this kind of host address.
    #[error("this transport cannot reach {0}")]
    UnsupportedAddress(HostAddress),

    /// `start` was called before a successful `prepare`.
    #[error("transport was not prepared")]
    NotPrepared,

    /// The relay SDK failed.
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
}

/// Host-side half of a transport.
pub trait ServerTransport: Send {
    /// Create listen sockets and other resources. Does no I/O after return.
    fn prepare(&mut self) -> Result<(), TransportError>;

    /// Begin accepting peers.
    fn start(&mut self) -> Result<(), TransportError>;

    /// Close every connection and release listen resources.
    fn stop(&mut self);

    /// Identity other peers see for this host.
    fn local_identity(&self) -> PeerId;

    /// Socket address actually bound, for transports that have one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Drain pending events, at most `max_per_peer` messages per peer.
    fn poll(&mut self, max_per_peer: usize, events: &mut Vec<TransportEvent>);

    fn connections(&self) -> Vec<Arc<dyn Connection>>;

    fn connection(&self, peer: PeerId) -> Option<Arc<dyn Connection>> {
        self.connections().into_iter().find(|c| c.peer_id() == peer)
    }

    /// Drop one peer. Emits no event.
    fn disconnect(&mut self, peer: PeerId);
}

/// Client-side half of a transport.
pub trait ClientTransport: Send {
    /// Start connecting. Completion is reported through [`TransportEvent::HostReachable`].
    fn connect(&mut self, host: HostAddress) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    /// Drain pending events, at most `max_per_peer` messages from the host.
    fn poll(&mut self, max_per_peer: usize, events: &mut Vec<TransportEvent>);

    fn host_connection(&self) -> Option<Arc<dyn Connection>>;

    /// Identity this client has on the transport, if it knows one.
    fn local_identity(&self) -> PeerId;
}
