//! Transport-blind session facade.
//!
//! [`Network`] owns the active [`Platform`], the [`Session`], the identity
//! registry, and the game's [`GameHooks`]. The game calls [`Network::tick`]
//! once per frame; every lobby callback, transport event, and packet handler
//! runs inside that call on the game thread.

use std::collections::BTreeSet;
use std::mem;

use tether_config::NetworkConfig;
use tokio::runtime::Handle;

use crate::connection::{Connection, Delivery, SendError};
use crate::control::{Hello, PROTOCOL_VERSION, Roster, Welcome};
use crate::hooks::{GameHooks, Notice};
use crate::identity::NetworkIdentities;
use crate::lobby::{LobbyError, LobbyEvent, LobbyOptions};
use crate::packet::{CodecError, Packet, decode, encode, peek_tag};
use crate::peer::{HostAddress, PeerId, PeerInfo};
use crate::platform::Platform;
use crate::reconnect::{CachedHost, ReconnectCache};
use crate::registry::{DispatchOutcome, HandlerContext, PacketHandler, PacketRegistry, RegistryError};
use crate::role::RoleError;
use crate::session::Session;
use crate::state::{ClientState, ServerState};
use crate::transport::TransportEvent;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Role(#[from] RoleError),

    #[error(transparent)]
    Lobby(#[from] LobbyError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("not in a session")]
    NotInSession,

    #[error("already in a session")]
    AlreadyInSession,

    #[error("no connection to peer {0}")]
    UnknownPeer(PeerId),
}

pub struct Network<G: GameHooks> {
    platform: Platform,
    registry: PacketRegistry<G>,
    session: Session,
    identities: NetworkIdentities<G::Entity>,
    reconnect: ReconnectCache,
    game: G,
    player_name: String,
    max_messages_per_peer: usize,
    /// Where the current client session was joined, for the reconnect cache.
    joined: Option<CachedHost>,
    events: Vec<TransportEvent>,
}

impl<G: GameHooks> Network<G> {
    pub fn new(platform: Platform, game: G, config: &NetworkConfig) -> Self {
        Self {
            platform,
            registry: PacketRegistry::new(),
            session: Session::new(),
            identities: NetworkIdentities::new(),
            reconnect: ReconnectCache::new(),
            game,
            player_name: config.player_name.clone(),
            max_messages_per_peer: config.relay.max_messages_per_tick.max(1),
            joined: None,
            events: Vec::new(),
        }
    }

    /// Raw-socket platform with socket tasks on `handle`.
    pub fn direct(config: &NetworkConfig, handle: Handle, game: G) -> Self {
        Self::new(Platform::direct(&config.direct, handle), game, config)
    }

    /// Register a payload type. Call before hosting or joining.
    pub fn register<P: PacketHandler<G>>(&mut self) -> Result<(), NetError> {
        Ok(self.registry.register::<P>()?)
    }

    // ---- Accessors ----

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn identities(&self) -> &NetworkIdentities<G::Entity> {
        &self.identities
    }

    pub fn identities_mut(&mut self) -> &mut NetworkIdentities<G::Entity> {
        &mut self.identities
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut G {
        &mut self.game
    }

    pub fn client_state(&self) -> ClientState {
        self.platform.client.state()
    }

    pub fn server_state(&self) -> ServerState {
        self.platform.server.state()
    }

    pub fn lobby_id(&self) -> Option<&str> {
        self.platform.lobby.lobby_id()
    }

    pub fn is_host(&self) -> bool {
        self.session.is_host()
    }

    // ---- Lobby operations ----

    /// Start the server role and open a lobby with the local peer as host.
    pub fn host(&mut self, options: &LobbyOptions) -> Result<(), NetError> {
        self.ensure_idle()?;
        if let Err(e) = self.platform.server.start() {
            self.game.notify(Notice::ServerFailed(e.to_string()));
            return Err(e.into());
        }
        if let Some(addr) = self.platform.server.local_addr() {
            self.platform.lobby.server_bound(addr);
        }
        if let Err(e) = self.platform.lobby.create(options) {
            tracing::error!("Lobby creation failed: {e}");
            self.platform.server.stop();
            self.game.notify(Notice::ServerFailed(e.to_string()));
            return Err(e.into());
        }

        let local = self.platform.server.local_identity();
        self.session
            .begin(PeerInfo::new(local, self.player_name.clone()), local);
        self.platform.lobby.apply_roster(&self.session.members());
        tracing::info!("Hosting session as {local}");
        Ok(())
    }

    /// Ask the lobby to join `lobby_id`. The client role starts once the
    /// lobby reports the host, during a later [`tick`](Self::tick).
    pub fn join(&mut self, lobby_id: &str) -> Result<(), NetError> {
        self.ensure_idle()?;
        self.join_lobby(lobby_id)
    }

    /// Tear down whichever role is active and forget the session.
    pub fn leave(&mut self) {
        if self.session.in_game() {
            let local = self.session.local_id();
            for peer in self.session.peers().filter(|p| p.id() != local) {
                self.game.on_peer_left(peer.id());
            }
        }
        self.platform.server.stop();
        if self.platform.client.is_active() {
            self.platform.client.disconnect();
        }
        self.platform.lobby.leave();
        self.session.clear();
        self.identities.clear();
        self.joined = None;
        self.events.clear();
    }

    /// Mark the local peer as fully in the simulated world.
    pub fn enter_game(&mut self) -> Result<(), NetError> {
        if !self.session.in_session() {
            return Err(NetError::NotInSession);
        }
        if self.session.in_game() {
            return Ok(());
        }
        if !self.session.is_host() {
            self.platform.client.enter_game()?;
        }
        self.session.set_in_game(true);

        let local = self.session.local_id();
        for peer in self.session.peers().filter(|p| p.id() != local) {
            self.game.on_peer_joined(&peer.info);
        }
        Ok(())
    }

    // ---- Reconnect cache ----

    /// Remember the current host so the session can be resumed later.
    /// Only a connected client has anything to cache.
    pub fn cache_connection(&mut self) -> bool {
        let connected = matches!(
            self.platform.client.state(),
            ClientState::Connected | ClientState::InGame
        );
        match &self.joined {
            Some(joined) if connected && !self.session.is_host() => {
                self.reconnect.cache(joined.clone());
                true
            }
            _ => false,
        }
    }

    pub fn has_cached_connection(&self) -> bool {
        self.reconnect.has_cached_connection()
    }

    pub fn clear_cached_connection(&mut self) {
        self.reconnect.clear();
    }

    /// Rejoin the cached host. The cache is emptied before anything else, so
    /// a failed attempt is not retried. Returns `false` when nothing was cached.
    pub fn reconnect_from_cache(&mut self) -> Result<bool, NetError> {
        let Some(cached) = self.reconnect.take() else {
            return Ok(false);
        };
        tracing::info!("Reconnecting to {} ({})", cached.host, cached.lobby_id);
        self.leave();
        self.join_lobby(&cached.lobby_id)?;
        Ok(true)
    }

    fn join_lobby(&mut self, lobby_id: &str) -> Result<(), NetError> {
        if let Err(e) = self.platform.lobby.join(lobby_id) {
            tracing::warn!("Could not join {lobby_id}: {e}");
            self.game.notify(Notice::ConnectionFailed(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    // ---- Sending ----

    pub fn send_to<P: Packet>(
        &self,
        peer: PeerId,
        packet: &P,
        delivery: Delivery,
    ) -> Result<(), NetError> {
        let conn = self
            .session
            .peer(peer)
            .and_then(|p| p.connection.clone())
            .ok_or(NetError::UnknownPeer(peer))?;
        conn.send(&encode(packet)?, delivery)?;
        Ok(())
    }

    /// Send to the host. Clients only.
    pub fn send_to_host<P: Packet>(&self, packet: &P, delivery: Delivery) -> Result<(), NetError> {
        let host = self.session.host_id().ok_or(NetError::NotInSession)?;
        let conn = self
            .platform
            .host_connection()
            .ok_or(NetError::UnknownPeer(host))?;
        conn.send(&encode(packet)?, delivery)?;
        Ok(())
    }

    /// Host: every client. Client: the host. Returns how many sends succeeded.
    pub fn broadcast<P: Packet>(&self, packet: &P, delivery: Delivery) -> Result<usize, NetError> {
        if !self.session.in_session() {
            return Err(NetError::NotInSession);
        }
        Ok(self.platform.send_to_all(&encode(packet)?, None, delivery))
    }

    /// Host only: drop `peer` from the session.
    pub fn kick(&mut self, peer: PeerId) {
        if !self.session.is_host() || peer == self.session.local_id() {
            return;
        }
        self.platform.server.disconnect(peer);
        self.on_peer_gone(peer, "kicked");
    }

    // ---- Tick ----

    /// Pump lobby and transport events and dispatch inbound packets.
    pub fn tick(&mut self) {
        if !self.pump_lobby() {
            return;
        }
        if self.platform.server.is_started() {
            self.pump_server();
        } else if self.platform.client.is_active() {
            self.pump_client();
        }
    }

    /// Returns false when a lobby failure tore the session down.
    fn pump_lobby(&mut self) -> bool {
        let mut events = Vec::new();
        self.platform.lobby.poll(&mut events);
        for event in events {
            match event {
                LobbyEvent::Created { lobby_id } => tracing::info!("Lobby {lobby_id} is open"),
                LobbyEvent::Joined { lobby_id, host } => self.begin_client(lobby_id, host),
                LobbyEvent::MembersChanged(members) => {
                    tracing::debug!("Lobby now has {} members", members.len());
                }
                LobbyEvent::Failed(e) => {
                    tracing::warn!("Lobby failed: {e}");
                    self.game.notify(Notice::ConnectionFailed(e.to_string()));
                    self.leave();
                    return false;
                }
            }
        }
        true
    }

    fn begin_client(&mut self, lobby_id: String, host: HostAddress) {
        if self.session.in_session() {
            tracing::warn!("Ignoring join of {lobby_id} while already in a session");
            return;
        }
        let host_id = match host {
            HostAddress::Relay(id) => id,
            HostAddress::Socket(addr) => PeerId::from_endpoint(addr),
        };
        let local = self.platform.client.local_identity();
        self.session
            .begin(PeerInfo::new(local, self.player_name.clone()), host_id);
        self.joined = Some(CachedHost {
            lobby_id: lobby_id.clone(),
            host,
        });

        tracing::info!("Joining {lobby_id} hosted at {host}");
        if let Err(e) = self.platform.client.connect(host) {
            self.game.notify(Notice::ConnectionFailed(e.to_string()));
            self.leave();
        }
    }

    // ---- Client side ----

    fn pump_client(&mut self) {
        let mut events = mem::take(&mut self.events);
        self.platform
            .client
            .poll(self.max_messages_per_peer, &mut events);

        for event in events.drain(..) {
            match event {
                TransportEvent::HostReachable => self.send_hello(),
                TransportEvent::Message { bytes, .. } => self.on_host_packet(&bytes),
                TransportEvent::HostLost(reason) => {
                    tracing::warn!("Lost connection to host: {reason}");
                    self.fail_client(Notice::HostLost(reason));
                    break;
                }
                TransportEvent::Failed(e) => {
                    tracing::error!("Client transport failed: {e}");
                    self.fail_client(Notice::ConnectionFailed(e.to_string()));
                    break;
                }
                TransportEvent::PeerConnected(_) | TransportEvent::PeerDisconnected { .. } => {}
            }
        }
        self.events = events;
    }

    fn fail_client(&mut self, notice: Notice) {
        self.game.notify(notice);
        self.platform.client.fail();
        self.leave();
    }

    fn send_hello(&mut self) {
        let Some(conn) = self.platform.host_connection() else {
            tracing::warn!("Host reported reachable without a connection");
            return;
        };
        let hello = Hello {
            name: self.player_name.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        if let Err(e) = send_packet(conn.as_ref(), &hello) {
            tracing::warn!("Failed to send hello to {}: {e}", conn.debug_name());
        }
    }

    fn on_host_packet(&mut self, bytes: &[u8]) {
        let tag = match peek_tag(bytes) {
            Ok(tag) => tag,
            Err(e) => {
                tracing::warn!("Dropping packet from host: {e}");
                return;
            }
        };

        let accepted = if tag == Welcome::TAG {
            match decode_control::<Welcome>(bytes) {
                Some(welcome) => {
                    self.on_welcome(welcome);
                    true
                }
                None => false,
            }
        } else if tag == Roster::TAG {
            match decode_control::<Roster>(bytes) {
                Some(roster) => {
                    self.on_roster(roster);
                    true
                }
                None => false,
            }
        } else if tag.is_reserved() {
            tracing::warn!("Dropping unexpected control packet {tag} from host");
            false
        } else {
            let host = self.session.host_id().unwrap_or_default();
            self.dispatch(host, bytes).is_handled()
        };

        if accepted && self.platform.client.on_host_message() {
            tracing::info!("Connected to host as {}", self.session.local_id());
        }
    }

    fn on_welcome(&mut self, welcome: Welcome) {
        let before = self.remote_ids();
        self.session.rebind_local(welcome.you);
        self.session.set_host(welcome.host.id);
        self.session.replace_members(&welcome.members);
        let conn = self.platform.host_connection();
        self.session.upsert_peer(welcome.host.clone(), conn);
        self.platform.lobby.apply_roster(&welcome.members);
        tracing::info!(
            "Welcomed by {} with {} members",
            welcome.host.name,
            welcome.members.len()
        );
        self.sync_proxies(&before);
    }

    fn on_roster(&mut self, roster: Roster) {
        let before = self.remote_ids();
        self.session.replace_members(&roster.members);
        self.platform.lobby.apply_roster(&roster.members);
        self.sync_proxies(&before);
    }

    // ---- Host side ----

    fn pump_server(&mut self) {
        let mut events = mem::take(&mut self.events);
        self.platform
            .server
            .poll(self.max_messages_per_peer, &mut events);

        for event in events.drain(..) {
            match event {
                TransportEvent::PeerConnected(peer) => {
                    tracing::debug!("Peer {peer} connected, waiting for hello");
                }
                TransportEvent::PeerDisconnected { peer, reason } => {
                    self.on_peer_gone(peer, &reason);
                }
                TransportEvent::Message { from, bytes } => self.on_peer_packet(from, &bytes),
                TransportEvent::Failed(e) => {
                    tracing::error!("Server transport failed: {e}");
                    self.game.notify(Notice::ServerFailed(e.to_string()));
                    self.platform.server.fail();
                    self.leave();
                    break;
                }
                TransportEvent::HostReachable | TransportEvent::HostLost(_) => {}
            }
        }
        self.events = events;
    }

    fn on_peer_packet(&mut self, from: PeerId, bytes: &[u8]) {
        let tag = match peek_tag(bytes) {
            Ok(tag) => tag,
            Err(e) => {
                tracing::warn!("Dropping packet from {from}: {e}");
                return;
            }
        };

        if tag == Hello::TAG {
            match decode_control::<Hello>(bytes) {
                Some(hello) => self.on_hello(from, hello),
                None => self.platform.server.disconnect(from),
            }
        } else if tag.is_reserved() {
            tracing::warn!("Dropping control packet {tag} sent by client {from}");
        } else if self.session.peer(from).is_none() {
            tracing::warn!("Dropping {tag} from {from} before hello");
        } else {
            self.dispatch(from, bytes);
        }
    }

    fn on_hello(&mut self, from: PeerId, hello: Hello) {
        if hello.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                "Peer {from} speaks protocol {}, expected {PROTOCOL_VERSION}",
                hello.protocol_version
            );
            self.platform.server.disconnect(from);
            return;
        }
        if from == self.session.local_id() {
            tracing::warn!("Peer {from} claims the host identity");
            self.platform.server.disconnect(from);
            return;
        }
        if self.session.peer(from).is_some() {
            tracing::debug!("Ignoring repeated hello from {from}");
            return;
        }
        let Some(conn) = self.platform.server.connection(from) else {
            tracing::warn!("Hello from {from} without a live connection");
            return;
        };
        let Some(host) = self.session.host_peer().map(|p| p.info.clone()) else {
            return;
        };

        let before = self.remote_ids();
        self.session
            .upsert_peer(PeerInfo::new(from, hello.name.clone()), Some(conn.clone()));
        let members = self.session.members();
        let welcome = Welcome {
            host,
            you: from,
            members: members.clone(),
        };
        if let Err(e) = send_packet(conn.as_ref(), &welcome) {
            tracing::warn!("Failed to welcome {}: {e}", conn.debug_name());
        }
        self.broadcast_roster(Some(from));
        self.platform.lobby.apply_roster(&members);
        tracing::info!("{} joined as {from}", hello.name);
        self.sync_proxies(&before);
    }

    fn on_peer_gone(&mut self, peer: PeerId, reason: &str) {
        let before = self.remote_ids();
        if self.session.remove_peer(peer).is_none() {
            tracing::debug!("Connection {peer} closed before joining: {reason}");
            return;
        }
        tracing::info!("Peer {peer} left: {reason}");
        self.broadcast_roster(None);
        self.platform.lobby.apply_roster(&self.session.members());
        self.sync_proxies(&before);
    }

    /// Send the roster to every joined peer except `exclude`.
    fn broadcast_roster(&self, exclude: Option<PeerId>) {
        let roster = Roster {
            members: self.session.members(),
        };
        let bytes = match encode(&roster) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode roster: {e}");
                return;
            }
        };
        for peer in self.session.peers() {
            if Some(peer.id()) == exclude {
                continue;
            }
            if let Some(conn) = &peer.connection
                && let Err(e) = conn.send(&bytes, Delivery::Reliable)
            {
                tracing::warn!("Roster to {} failed: {e}", conn.debug_name());
            }
        }
    }

    // ---- Shared ----

    fn dispatch(&mut self, sender: PeerId, bytes: &[u8]) -> DispatchOutcome {
        let mut ctx = HandlerContext::new(
            sender,
            &self.session,
            &mut self.identities,
            &mut self.game,
            &self.platform,
        );
        self.registry.decode_and_dispatch(bytes, &mut ctx)
    }

    fn ensure_idle(&self) -> Result<(), NetError> {
        if self.session.in_session()
            || self.platform.client.is_active()
            || self.platform.server.state() != ServerState::Stopped
            || self.platform.lobby.lobby_id().is_some()
        {
            return Err(NetError::AlreadyInSession);
        }
        Ok(())
    }

    fn remote_ids(&self) -> BTreeSet<PeerId> {
        let local = self.session.local_id();
        self.session
            .peers()
            .map(|p| p.id())
            .filter(|id| *id != local)
            .collect()
    }

    /// Create or remove proxies for peers that came or went while in game.
    fn sync_proxies(&mut self, before: &BTreeSet<PeerId>) {
        if !self.session.in_game() {
            return;
        }
        let after = self.remote_ids();
        for gone in before.difference(&after) {
            self.game.on_peer_left(*gone);
        }
        for id in after.difference(before) {
            if let Some(peer) = self.session.peer(*id) {
                self.game.on_peer_joined(&peer.info);
            }
        }
    }
}

impl<G: GameHooks> Drop for Network<G> {
    fn drop(&mut self) {
        self.platform.server.stop();
        if self.platform.client.is_active() {
            self.platform.client.disconnect();
        }
    }
}

fn send_packet<P: Packet>(conn: &dyn Connection, packet: &P) -> Result<(), NetError> {
    conn.send(&encode(packet)?, Delivery::Reliable)?;
    Ok(())
}

/// Decode and validate a control packet, logging what went wrong.
fn decode_control<P: Packet>(bytes: &[u8]) -> Option<P> {
    match decode::<P>(bytes) {
        Ok(packet) if packet.is_valid() => Some(packet),
        Ok(packet) => {
            tracing::warn!("Dropping invalid {packet:?}");
            None
        }
        Err(e) => {
            tracing::warn!("Malformed control packet: {e}");
            None
        }
    }
}
