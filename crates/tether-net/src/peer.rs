//! Peer identity types shared by every transport.

use std::fmt;
use std::hash::Hasher;
use std::net::{IpAddr, SocketAddr};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

/// Stable identifier of one participant in a session.
///
/// Relay transports use the rendezvous service's account identity. The raw
/// socket transport derives it from the remote endpoint.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Placeholder for a local identity the host has not assigned yet.
    pub const UNASSIGNED: PeerId = PeerId(0);

    /// Derive an identifier from a socket endpoint.
    ///
    /// IPv4 endpoints map reversibly to `ip << 16 | port`. IPv6 endpoints are
    /// hashed, with the top bit set so the two spaces never overlap.
    pub fn from_endpoint(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => PeerId((u64::from(u32::from(ip)) << 16) | u64::from(addr.port())),
            IpAddr::V6(ip) => {
                let mut hasher = FxHasher::default();
                hasher.write(&ip.octets());
                hasher.write_u16(addr.port());
                PeerId(hasher.finish() | (1 << 63))
            }
        }
    }

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identity plus display name, as carried in rosters and lobby member lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
}

impl PeerInfo {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Where a client connects to reach the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostAddress {
    /// Raw TCP endpoint.
    Socket(SocketAddr),
    /// Relay identity resolved through the rendezvous service.
    Relay(PeerId),
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddress::Socket(addr) => write!(f, "{addr}"),
            HostAddress::Relay(peer) => write!(f, "relay:{peer}"),
        }
    }
}
