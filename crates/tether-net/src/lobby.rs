//! Session discovery and membership.
//!
//! Creating a lobby makes the local peer host; joining yields the host
//! address the client role should connect to. Results and membership
//! changes are reported as [`LobbyEvent`]s from [`Lobby::poll`].

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

use crate::peer::{HostAddress, PeerInfo};
use crate::relay::RelayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyOptions {
    /// Member limit including the host.
    pub max_members: usize,
}

impl Default for LobbyOptions {
    fn default() -> Self {
        Self { max_members: 4 }
    }
}

#[derive(Debug)]
pub enum LobbyEvent {
    Created { lobby_id: String },
    Joined { lobby_id: String, host: HostAddress },
    MembersChanged(Vec<PeerInfo>),
    Failed(LobbyError),
}

#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    #[error("already in lobby {0:?}")]
    AlreadyInLobby(String),

    #[error("invalid lobby id {0:?}")]
    InvalidLobbyId(String),

    #[error("lobby service error: {0}")]
    Relay(#[from] RelayError),
}

/// One platform's lobby.
pub trait Lobby: Send {
    fn create(&mut self, options: &LobbyOptions) -> Result<(), LobbyError>;

    fn join(&mut self, lobby_id: &str) -> Result<(), LobbyError>;

    /// Leave and reset the cached membership. No event is emitted.
    fn leave(&mut self);

    fn lobby_id(&self) -> Option<&str>;

    fn members(&self) -> &[PeerInfo];

    fn poll(&mut self, events: &mut Vec<LobbyEvent>);

    /// Replace membership with the host's authoritative roster. Lobbies
    /// backed by a rendezvous service keep their own list and ignore this.
    fn apply_roster(&mut self, _members: &[PeerInfo]) {}

    /// Told where the local server actually listens, before `create`.
    fn server_bound(&mut self, _addr: SocketAddr) {}
}

/// Lobby for raw-socket sessions: the id is simply the host's `ip:port`.
#[derive(Debug)]
pub struct DirectLobby {
    advertise_address: String,
    port: u16,
    lobby_id: Option<String>,
    members: Vec<PeerInfo>,
    pending: VecDeque<LobbyEvent>,
}

impl DirectLobby {
    pub fn new(advertise_address: impl Into<String>, port: u16) -> Self {
        Self {
            advertise_address: advertise_address.into(),
            port,
            lobby_id: None,
            members: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn ensure_idle(&self) -> Result<(), LobbyError> {
        match &self.lobby_id {
            Some(id) => Err(LobbyError::AlreadyInLobby(id.clone())),
            None => Ok(()),
        }
    }
}

impl Lobby for DirectLobby {
    fn create(&mut self, _options: &LobbyOptions) -> Result<(), LobbyError> {
        self.ensure_idle()?;
        let ip: IpAddr = self
            .advertise_address
            .parse()
            .map_err(|_| LobbyError::InvalidLobbyId(self.advertise_address.clone()))?;
        let lobby_id = SocketAddr::new(ip, self.port).to_string();
        self.lobby_id = Some(lobby_id.clone());
        self.pending.push_back(LobbyEvent::Created { lobby_id });
        Ok(())
    }

    fn join(&mut self, lobby_id: &str) -> Result<(), LobbyError> {
        self.ensure_idle()?;
        let addr: SocketAddr = lobby_id
            .trim()
            .parse()
            .map_err(|_| LobbyError::InvalidLobbyId(lobby_id.to_string()))?;
        self.lobby_id = Some(addr.to_string());
        self.pending.push_back(LobbyEvent::Joined {
            lobby_id: addr.to_string(),
            host: HostAddress::Socket(addr),
        });
        Ok(())
    }

    fn leave(&mut self) {
        self.lobby_id = None;
        self.members.clear();
        self.pending.clear();
    }

    fn lobby_id(&self) -> Option<&str> {
        self.lobby_id.as_deref()
    }

    fn members(&self) -> &[PeerInfo] {
        &self.members
    }

    fn poll(&mut self, events: &mut Vec<LobbyEvent>) {
        events.extend(self.pending.drain(..));
    }

    fn server_bound(&mut self, addr: SocketAddr) {
        self.port = addr.port();
    }

    fn apply_roster(&mut self, members: &[PeerInfo]) {
        if self.lobby_id.is_none() || self.members == members {
            return;
        }
        self.members = members.to_vec();
        self.pending
            .push_back(LobbyEvent::MembersChanged(self.members.clone()));
    }
}
