//! The per-peer channel every transport implements.

use std::fmt;

use crate::peer::PeerId;
use crate::relay::RelayError;

/// How a message should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Delivery {
    /// Ordered and retransmitted.
    #[default]
    Reliable,
    /// Best effort. The raw-socket transport sends these reliably anyway.
    Unreliable,
}

/// Errors returned by [`Connection::send`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The connection has been closed or invalidated.
    #[error("connection to {0} is closed")]
    Closed(PeerId),

    /// The peer is not keeping up; the connection has been dropped.
    #[error("outbound queue to {0} is full")]
    QueueFull(PeerId),

    /// The message exceeds what the transport can carry.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    /// The relay SDK refused the message.
    #[error("relay send failed: {0}")]
    Relay(#[from] RelayError),
}

/// A live channel to exactly one peer.
///
/// Owned by the transport that created it. Other components hold shared
/// handles and must stop using them once `is_valid` turns false.
pub trait Connection: Send + Sync + fmt::Debug {
    fn peer_id(&self) -> PeerId;

    /// Queue an already-encoded packet for delivery.
    fn send(&self, bytes: &[u8], delivery: Delivery) -> Result<(), SendError>;

    fn is_valid(&self) -> bool;

    /// Human-readable name for log lines.
    fn debug_name(&self) -> String;
}
