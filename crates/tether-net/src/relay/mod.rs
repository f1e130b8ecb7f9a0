//! Relay transports: the same connection contract carried over a
//! rendezvous-backed peer-to-peer SDK instead of raw sockets.
//!
//! The SDKs are reached through traits ([`SocketsRelayApi`],
//! [`PacketsRelayApi`], [`LobbyService`]). Their asynchronous callbacks are
//! delivered as `crossbeam-channel` queues which the owning role drains once
//! per tick. Lifecycle callbacks are never dropped. Session state is only
//! touched from the game thread. [`loopback`] provides an in-process
//! implementation of all three.

pub mod lobby;
pub mod loopback;
pub mod packets;
pub mod sockets;

pub use lobby::{LobbyService, LobbyServiceEvent, RelayLobby};
pub use loopback::{LoopbackEndpoint, LoopbackFabric};
pub use packets::{PacketsRelayApi, PacketsRelayClient, PacketsRelayServer};
pub use sockets::{SocketsRelayApi, SocketsRelayClient, SocketsRelayServer};

use crate::peer::PeerId;

/// Errors reported by a relay SDK.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("unknown relay connection {0}")]
    UnknownConnection(u64),

    #[error("no relay connection to peer {0}")]
    UnknownPeer(PeerId),

    #[error("relay rejected the request: {0}")]
    Rejected(String),

    #[error("relay service unavailable: {0}")]
    Unavailable(String),

    #[error("no lobby with id {0:?}")]
    NoSuchLobby(String),
}
