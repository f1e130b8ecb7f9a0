//! Lobbies hosted by the relay's rendezvous service.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::lobby::{Lobby, LobbyError, LobbyEvent, LobbyOptions};
use crate::peer::{HostAddress, PeerId, PeerInfo};
use crate::relay::RelayError;

/// Membership notification from the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyServiceEvent {
    MemberJoined { lobby: String, member: PeerInfo },
    MemberLeft { lobby: String, member: PeerId },
}

impl LobbyServiceEvent {
    pub fn lobby(&self) -> &str {
        match self {
            Self::MemberJoined { lobby, .. } | Self::MemberLeft { lobby, .. } => lobby,
        }
    }
}

/// Rendezvous lobby API, acting as the local account.
pub trait LobbyService: Send + Sync {
    /// Create a lobby owned by the local account and return its id.
    fn create_lobby(&self, max_members: usize) -> Result<String, RelayError>;

    /// Join and return the owner's identity.
    fn join_lobby(&self, lobby: &str) -> Result<PeerId, RelayError>;

    fn leave_lobby(&self, lobby: &str);

    fn lobby_owner(&self, lobby: &str) -> Option<PeerId>;

    fn lobby_members(&self, lobby: &str) -> Vec<PeerInfo>;

    /// Register for membership notifications. Events are never dropped;
    /// a backlog growing past `capacity` is reported.
    fn lobby_events(&self, capacity: usize) -> Receiver<LobbyServiceEvent>;
}

/// [`Lobby`] over a [`LobbyService`].
pub struct RelayLobby {
    service: Arc<dyn LobbyService>,
    event_capacity: usize,
    lobby_id: Option<String>,
    members: Vec<PeerInfo>,
    updates: Option<Receiver<LobbyServiceEvent>>,
    pending: VecDeque<LobbyEvent>,
}

impl RelayLobby {
    pub fn new(service: Arc<dyn LobbyService>, event_capacity: usize) -> Self {
        Self {
            service,
            event_capacity,
            lobby_id: None,
            members: Vec::new(),
            updates: None,
            pending: VecDeque::new(),
        }
    }

    fn ensure_idle(&self) -> Result<(), LobbyError> {
        match &self.lobby_id {
            Some(id) => Err(LobbyError::AlreadyInLobby(id.clone())),
            None => Ok(()),
        }
    }

    fn enter(&mut self, lobby_id: String, updates: Receiver<LobbyServiceEvent>) {
        self.members = self.service.lobby_members(&lobby_id);
        self.lobby_id = Some(lobby_id);
        self.updates = Some(updates);
    }
}

impl Lobby for RelayLobby {
    fn create(&mut self, options: &LobbyOptions) -> Result<(), LobbyError> {
        self.ensure_idle()?;
        let updates = self.service.lobby_events(self.event_capacity);
        let lobby_id = self.service.create_lobby(options.max_members)?;
        tracing::info!("Created relay lobby {lobby_id}");
        self.enter(lobby_id.clone(), updates);
        self.pending.push_back(LobbyEvent::Created { lobby_id });
        Ok(())
    }

    fn join(&mut self, lobby_id: &str) -> Result<(), LobbyError> {
        self.ensure_idle()?;
        let updates = self.service.lobby_events(self.event_capacity);
        let owner = self.service.join_lobby(lobby_id)?;
        tracing::info!("Joined relay lobby {lobby_id} owned by {owner}");
        self.enter(lobby_id.to_string(), updates);
        self.pending.push_back(LobbyEvent::Joined {
            lobby_id: lobby_id.to_string(),
            host: HostAddress::Relay(owner),
        });
        Ok(())
    }

    fn leave(&mut self) {
        if let Some(id) = self.lobby_id.take() {
            self.service.leave_lobby(&id);
            tracing::info!("Left relay lobby {id}");
        }
        self.members.clear();
        self.updates = None;
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

        let (Some(id), Some(updates)) = (&self.lobby_id, &self.updates) else {
            return;
        };
        let changed = updates.try_iter().filter(|e| e.lobby() == id).count() > 0;
        if changed {
            self.members = self.service.lobby_members(id);
            events.push(LobbyEvent::MembersChanged(self.members.clone()));
        }
    }
}
