//! The game-side bridge: typed callbacks in place of reaching into engine state.

use std::hash::Hash;

use crate::peer::{PeerId, PeerInfo};

/// A user-facing failure, shown transiently by the game's overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Joining or reaching the host failed.
    ConnectionFailed(String),
    HostLost(String),
    /// Hosting could not start, or the running server broke.
    ServerFailed(String),
}

/// Implemented by the game. Passed mutably to every packet handler.
pub trait GameHooks: Send + 'static {
    /// Entity key used by the identity registry.
    type Entity: Copy + Eq + Hash + Send;

    /// A peer became visible while in game: create its cursor or proxy.
    fn on_peer_joined(&mut self, _peer: &PeerInfo) {}

    /// A peer went away while in game: remove its cursor or proxy.
    fn on_peer_left(&mut self, _peer: PeerId) {}

    fn notify(&mut self, notice: Notice) {
        tracing::info!("{notice:?}");
    }
}
