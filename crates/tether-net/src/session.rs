//! The current session: who hosts it and who is in it.
//!
//! Read access is public. Mutation is crate-internal and funnelled through
//! [`Network`](crate::Network) lobby and transport event handling.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::connection::Connection;
use crate::peer::{PeerId, PeerInfo};

/// One participant.
#[derive(Debug, Clone)]
pub struct Peer {
    pub info: PeerInfo,
    /// Channel to this peer, when there is a direct one. Clients only hold
    /// a connection to the host.
    pub connection: Option<Arc<dyn Connection>>,
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}

#[derive(Debug, Default)]
pub struct Session {
    local: PeerId,
    host: Option<PeerId>,
    in_session: bool,
    in_game: bool,
    peers: BTreeMap<PeerId, Peer>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn host_id(&self) -> Option<PeerId> {
        self.host
    }

    /// True when the local peer is the recorded host.
    pub fn is_host(&self) -> bool {
        self.in_session && self.host == Some(self.local)
    }

    pub fn in_session(&self) -> bool {
        self.in_session
    }

    pub fn in_game(&self) -> bool {
        self.in_game
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn host_peer(&self) -> Option<&Peer> {
        self.host.and_then(|id| self.peers.get(&id))
    }

    pub fn is_host_peer(&self, id: PeerId) -> bool {
        self.host == Some(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Membership in id order.
    pub fn members(&self) -> Vec<PeerInfo> {
        self.peers.values().map(|p| p.info.clone()).collect()
    }

    /// Start a session as `local` under `host`. Any previous state is dropped.
    pub(crate) fn begin(&mut self, local: PeerInfo, host: PeerId) {
        self.clear();
        self.local = local.id;
        self.host = Some(host);
        self.in_session = true;
        self.peers.insert(
            local.id,
            Peer {
                info: local,
                connection: None,
            },
        );
    }

    /// Change the local identity once the host has told us who we are.
    pub(crate) fn rebind_local(&mut self, local: PeerId) {
        if local == self.local {
            return;
        }
        if let Some(mut peer) = self.peers.remove(&self.local) {
            peer.info.id = local;
            self.peers.insert(local, peer);
        }
        self.local = local;
    }

    /// Record the host's real identity. A stale entry under the old id is dropped.
    pub(crate) fn set_host(&mut self, host: PeerId) {
        if let Some(old) = self.host.filter(|old| *old != host && *old != self.local) {
            self.peers.remove(&old);
        }
        self.host = Some(host);
    }

    /// Insert or update a peer. An existing connection is kept when `connection` is `None`.
    pub(crate) fn upsert_peer(&mut self, info: PeerInfo, connection: Option<Arc<dyn Connection>>) {
        match self.peers.get_mut(&info.id) {
            Some(peer) => {
                peer.info = info;
                if connection.is_some() {
                    peer.connection = connection;
                }
            }
            None => {
                self.peers.insert(info.id, Peer { info, connection });
            }
        }
    }

    pub(crate) fn remove_peer(&mut self, id: PeerId) -> Option<Peer> {
        if id == self.local {
            return None;
        }
        self.peers.remove(&id)
    }

    /// Replace membership with `members`, keeping connections of peers that
    /// stay. The local and host entries are never dropped.
    pub(crate) fn replace_members(&mut self, members: &[PeerInfo]) {
        let local = self.local;
        let host = self.host;
        self.peers.retain(|id, _| {
            *id == local || Some(*id) == host || members.iter().any(|m| m.id == *id)
        });
        for member in members {
            self.upsert_peer(member.clone(), None);
        }
    }

    pub(crate) fn set_in_game(&mut self, in_game: bool) {
        self.in_game = in_game && self.in_session;
    }

    pub(crate) fn clear(&mut self) {
        self.host = None;
        self.in_session = false;
        self.in_game = false;
        self.peers.clear();
    }
}
