//! In-process rendezvous fabric.
//!
//! Implements [`SocketsRelayApi`], [`PacketsRelayApi`] and [`LobbyService`]
//! for any number of endpoints living in one process. All delivery is
//! reliable and ordered.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender};

use crate::connection::Delivery;
use crate::peer::{PeerId, PeerInfo};
use crate::relay::RelayError;
use crate::relay::lobby::{LobbyService, LobbyServiceEvent};
use crate::relay::packets::{P2pEvent, PacketReliability, PacketsRelayApi, ReceivedPacket};
use crate::relay::sockets::{
    ConnHandle, ConnectionState, ConnectionStatusChanged, ListenHandle, SocketsRelayApi,
};

/// Packet limit of the packet-oriented surface unless overridden.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1170;

/// Shared rendezvous state. Clone to hand out more endpoints.
#[derive(Clone)]
pub struct LoopbackFabric {
    state: Arc<Mutex<FabricState>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(FabricState {
                max_packet_size: max_packet_size.max(2),
                ..Default::default()
            })),
        }
    }

    /// Register an account and return its SDK handle.
    pub fn endpoint(&self, peer: PeerId, name: impl Into<String>) -> Arc<LoopbackEndpoint> {
        let name = name.into();
        lock(&self.state).names.insert(peer, name.clone());
        Arc::new(LoopbackEndpoint {
            state: Arc::clone(&self.state),
            peer,
            name,
        })
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(state: &Mutex<FabricState>) -> MutexGuard<'_, FabricState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A callback queue. Lifecycle events are never dropped; `high_water` only
/// controls when a growing backlog is reported.
struct Subscriber<T> {
    tx: Sender<T>,
    high_water: usize,
}

fn subscribe<T>(subscribers: &mut Vec<Subscriber<T>>, capacity: usize) -> Receiver<T> {
    let (tx, rx) = crossbeam_channel::unbounded();
    subscribers.push(Subscriber {
        tx,
        high_water: capacity.max(1),
    });
    rx
}

/// Send to every live subscriber, pruning dropped ones.
fn publish<T: Clone>(subscribers: Option<&mut Vec<Subscriber<T>>>, event: T) {
    let Some(subscribers) = subscribers else {
        return;
    };
    subscribers.retain(|sub| {
        if sub.tx.send(event.clone()).is_err() {
            return false;
        }
        let backlog = sub.tx.len();
        if backlog > sub.high_water {
            tracing::warn!(
                "Relay event backlog at {backlog} (high-water mark {})",
                sub.high_water
            );
        }
        true
    });
}

struct SocketConn {
    owner: PeerId,
    remote: PeerId,
    peer_conn: Option<u64>,
    listen: Option<ListenHandle>,
    state: ConnectionState,
    inbox: VecDeque<Vec<u8>>,
}

struct LobbyRecord {
    owner: PeerId,
    max_members: usize,
    members: Vec<PeerInfo>,
}

/// (local, remote, socket name)
type LinkKey = (PeerId, PeerId, String);

#[derive(Default)]
struct FabricState {
    names: HashMap<PeerId, String>,
    next_handle: u64,
    max_packet_size: usize,

    listen_sockets: HashMap<ListenHandle, (PeerId, u16)>,
    conns: HashMap<u64, SocketConn>,
    status_subs: HashMap<PeerId, Vec<Subscriber<ConnectionStatusChanged>>>,

    accepted: HashSet<LinkKey>,
    packets: HashMap<(PeerId, String), VecDeque<ReceivedPacket>>,
    p2p_subs: HashMap<(PeerId, String), Vec<Subscriber<P2pEvent>>>,

    lobbies: HashMap<String, LobbyRecord>,
    next_lobby: u64,
    lobby_subs: HashMap<PeerId, Vec<Subscriber<LobbyServiceEvent>>>,
}

impl FabricState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn notify_status(&mut self, handle: u64, reason: &str) {
        let Some(conn) = self.conns.get(&handle) else {
            return;
        };
        let owner = conn.owner;
        let event = ConnectionStatusChanged {
            conn: ConnHandle(handle),
            remote: conn.remote,
            listen: conn.listen,
            state: conn.state,
            reason: reason.to_string(),
        };
        publish(self.status_subs.get_mut(&owner), event);
    }

    fn close_socket_conn(&mut self, handle: u64, reason: &str) {
        let Some(conn) = self.conns.remove(&handle) else {
            return;
        };
        let Some(peer_handle) = conn.peer_conn else {
            return;
        };
        if let Some(peer) = self.conns.get_mut(&peer_handle) {
            peer.peer_conn = None;
            if !peer.state.is_closed() {
                peer.state = ConnectionState::ClosedByPeer;
                self.notify_status(peer_handle, reason);
            }
        }
    }

    fn is_linked(&self, a: PeerId, b: PeerId, socket: &str) -> bool {
        self.accepted.contains(&(a, b, socket.to_string()))
            && self.accepted.contains(&(b, a, socket.to_string()))
    }

    fn notify_p2p(&mut self, target: PeerId, socket: &str, event: P2pEvent) {
        publish(self.p2p_subs.get_mut(&(target, socket.to_string())), event);
    }

    fn notify_lobby(&mut self, members: &[PeerId], event: LobbyServiceEvent) {
        for member in members {
            publish(self.lobby_subs.get_mut(member), event.clone());
        }
    }
}

/// One account's view of a [`LoopbackFabric`].
pub struct LoopbackEndpoint {
    state: Arc<Mutex<FabricState>>,
    peer: PeerId,
    name: String,
}

impl LoopbackEndpoint {
    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, FabricState> {
        lock(&self.state)
    }
}

impl SocketsRelayApi for LoopbackEndpoint {
    fn local_identity(&self) -> PeerId {
        self.peer
    }

    fn create_listen_socket(&self, virtual_port: u16) -> Result<ListenHandle, RelayError> {
        let mut state = self.state();
        if state
            .listen_sockets
            .values()
            .any(|&(owner, port)| owner == self.peer && port == virtual_port)
        {
            return Err(RelayError::Rejected(format!(
                "virtual port {virtual_port} already in use"
            )));
        }
        let handle = ListenHandle(state.next_handle());
        state.listen_sockets.insert(handle, (self.peer, virtual_port));
        Ok(handle)
    }

    fn close_listen_socket(&self, socket: ListenHandle) {
        let mut state = self.state();
        state.listen_sockets.remove(&socket);
        let accepted: Vec<u64> = state
            .conns
            .iter()
            .filter(|(_, c)| c.listen == Some(socket))
            .map(|(&h, _)| h)
            .collect();
        for handle in accepted {
            state.close_socket_conn(handle, "listen socket closed");
        }
    }

    fn connect(&self, remote: PeerId, virtual_port: u16) -> Result<ConnHandle, RelayError> {
        let mut state = self.state();
        let listen = state
            .listen_sockets
            .iter()
            .find(|(_, bound)| **bound == (remote, virtual_port))
            .map(|(&h, _)| h)
            .ok_or_else(|| {
                RelayError::Unavailable(format!(
                    "{remote} is not listening on virtual port {virtual_port}"
                ))
            })?;

        let local = state.next_handle();
        let accepted = state.next_handle();
        state.conns.insert(
            local,
            SocketConn {
                owner: self.peer,
                remote,
                peer_conn: Some(accepted),
                listen: None,
                state: ConnectionState::Connecting,
                inbox: VecDeque::new(),
            },
        );
        state.conns.insert(
            accepted,
            SocketConn {
                owner: remote,
                remote: self.peer,
                peer_conn: Some(local),
                listen: Some(listen),
                state: ConnectionState::Connecting,
                inbox: VecDeque::new(),
            },
        );
        state.notify_status(local, "");
        state.notify_status(accepted, "");
        Ok(ConnHandle(local))
    }

    fn accept(&self, conn: ConnHandle) -> Result<(), RelayError> {
        let mut state = self.state();
        let entry = state
            .conns
            .get_mut(&conn.0)
            .filter(|c| c.owner == self.peer)
            .ok_or(RelayError::UnknownConnection(conn.0))?;
        if entry.listen.is_none() || entry.state != ConnectionState::Connecting {
            return Err(RelayError::Rejected("connection is not awaiting accept".into()));
        }
        entry.state = ConnectionState::Connected;
        let peer_handle = entry.peer_conn;

        match peer_handle.and_then(|h| state.conns.get_mut(&h).map(|c| (h, c))) {
            Some((h, peer)) => {
                peer.state = ConnectionState::Connected;
                state.notify_status(conn.0, "");
                state.notify_status(h, "");
                Ok(())
            }
            None => Err(RelayError::UnknownConnection(conn.0)),
        }
    }

    fn close(&self, conn: ConnHandle, reason: &str) {
        self.state().close_socket_conn(conn.0, reason);
    }

    fn send(&self, conn: ConnHandle, bytes: &[u8], _delivery: Delivery) -> Result<(), RelayError> {
        let mut state = self.state();
        let entry = state
            .conns
            .get(&conn.0)
            .filter(|c| c.owner == self.peer)
            .ok_or(RelayError::UnknownConnection(conn.0))?;
        if entry.state != ConnectionState::Connected {
            return Err(RelayError::Rejected("connection is not open".into()));
        }
        let peer_handle = entry.peer_conn.ok_or(RelayError::UnknownConnection(conn.0))?;
        let peer = state
            .conns
            .get_mut(&peer_handle)
            .ok_or(RelayError::UnknownConnection(conn.0))?;
        peer.inbox.push_back(bytes.to_vec());
        Ok(())
    }

    fn receive(&self, conn: ConnHandle, max: usize) -> Vec<Vec<u8>> {
        let mut state = self.state();
        let Some(entry) = state.conns.get_mut(&conn.0) else {
            return Vec::new();
        };
        let n = entry.inbox.len().min(max);
        entry.inbox.drain(..n).collect()
    }

    fn subscribe_status(&self, capacity: usize) -> Receiver<ConnectionStatusChanged> {
        let mut state = self.state();
        subscribe(state.status_subs.entry(self.peer).or_default(), capacity)
    }
}

impl PacketsRelayApi for LoopbackEndpoint {
    fn local_user(&self) -> PeerId {
        self.peer
    }

    fn subscribe(&self, socket: &str, capacity: usize) -> Receiver<P2pEvent> {
        let mut state = self.state();
        let subs = state
            .p2p_subs
            .entry((self.peer, socket.to_string()))
            .or_default();
        subscribe(subs, capacity)
    }

    fn accept_connection(&self, remote: PeerId, socket: &str) -> Result<(), RelayError> {
        let mut state = self.state();
        if !state.names.contains_key(&remote) {
            return Err(RelayError::UnknownPeer(remote));
        }
        if state.is_linked(self.peer, remote, socket) {
            return Ok(());
        }
        state
            .accepted
            .insert((self.peer, remote, socket.to_string()));

        if state.is_linked(self.peer, remote, socket) {
            state.notify_p2p(self.peer, socket, P2pEvent::ConnectionEstablished { remote });
            state.notify_p2p(
                remote,
                socket,
                P2pEvent::ConnectionEstablished { remote: self.peer },
            );
        } else {
            state.notify_p2p(
                remote,
                socket,
                P2pEvent::ConnectionRequested { remote: self.peer },
            );
        }
        Ok(())
    }

    fn close_connection(&self, remote: PeerId, socket: &str) {
        let mut state = self.state();
        let ours = state.accepted.remove(&(self.peer, remote, socket.to_string()));
        let theirs = state.accepted.remove(&(remote, self.peer, socket.to_string()));
        if let Some(queue) = state.packets.get_mut(&(self.peer, socket.to_string())) {
            queue.retain(|p| p.from != remote);
        }
        if let Some(queue) = state.packets.get_mut(&(remote, socket.to_string())) {
            queue.retain(|p| p.from != self.peer);
        }
        if ours || theirs {
            state.notify_p2p(
                remote,
                socket,
                P2pEvent::ConnectionClosed {
                    remote: self.peer,
                    reason: "closed by remote".to_string(),
                },
            );
        }
    }

    fn send_packet(
        &self,
        remote: PeerId,
        socket: &str,
        channel: u8,
        _reliability: PacketReliability,
        bytes: &[u8],
    ) -> Result<(), RelayError> {
        let mut state = self.state();
        if !state.is_linked(self.peer, remote, socket) {
            return Err(RelayError::UnknownPeer(remote));
        }
        if bytes.len() > state.max_packet_size {
            return Err(RelayError::Rejected(format!(
                "packet of {} bytes exceeds {}",
                bytes.len(),
                state.max_packet_size
            )));
        }
        state
            .packets
            .entry((remote, socket.to_string()))
            .or_default()
            .push_back(ReceivedPacket {
                from: self.peer,
                channel,
                bytes: bytes.to_vec(),
            });
        Ok(())
    }

    fn receive_packet(&self, socket: &str, from: PeerId) -> Option<ReceivedPacket> {
        let mut state = self.state();
        let queue = state.packets.get_mut(&(self.peer, socket.to_string()))?;
        let index = queue.iter().position(|p| p.from == from)?;
        queue.remove(index)
    }

    fn max_packet_size(&self) -> usize {
        self.state().max_packet_size
    }
}

impl LobbyService for LoopbackEndpoint {
    fn create_lobby(&self, max_members: usize) -> Result<String, RelayError> {
        let mut state = self.state();
        state.next_lobby += 1;
        let id = format!("lobby-{}", state.next_lobby);
        state.lobbies.insert(
            id.clone(),
            LobbyRecord {
                owner: self.peer,
                max_members: max_members.max(1),
                members: vec![PeerInfo::new(self.peer, self.name.clone())],
            },
        );
        Ok(id)
    }

    fn join_lobby(&self, lobby: &str) -> Result<PeerId, RelayError> {
        let mut state = self.state();
        let record = state
            .lobbies
            .get_mut(lobby)
            .ok_or_else(|| RelayError::NoSuchLobby(lobby.to_string()))?;
        let owner = record.owner;
        if record.members.iter().any(|m| m.id == self.peer) {
            return Ok(owner);
        }
        if record.members.len() >= record.max_members {
            return Err(RelayError::Rejected("lobby is full".to_string()));
        }

        let others: Vec<PeerId> = record.members.iter().map(|m| m.id).collect();
        let member = PeerInfo::new(self.peer, self.name.clone());
        record.members.push(member.clone());
        state.notify_lobby(
            &others,
            LobbyServiceEvent::MemberJoined {
                lobby: lobby.to_string(),
                member,
            },
        );
        Ok(owner)
    }

    fn leave_lobby(&self, lobby: &str) {
        let mut state = self.state();
        let Some(record) = state.lobbies.get_mut(lobby) else {
            return;
        };
        record.members.retain(|m| m.id != self.peer);
        let remaining: Vec<PeerId> = record.members.iter().map(|m| m.id).collect();
        // The lobby dies with its owner.
        if record.owner == self.peer || remaining.is_empty() {
            state.lobbies.remove(lobby);
        }
        state.notify_lobby(
            &remaining,
            LobbyServiceEvent::MemberLeft {
                lobby: lobby.to_string(),
                member: self.peer,
            },
        );
    }

    fn lobby_owner(&self, lobby: &str) -> Option<PeerId> {
        self.state().lobbies.get(lobby).map(|r| r.owner)
    }

    fn lobby_members(&self, lobby: &str) -> Vec<PeerInfo> {
        self.state()
            .lobbies
            .get(lobby)
            .map(|r| r.members.clone())
            .unwrap_or_default()
    }

    fn lobby_events(&self, capacity: usize) -> Receiver<LobbyServiceEvent> {
        let mut state = self.state();
        subscribe(state.lobby_subs.entry(self.peer).or_default(), capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_connect_requires_listener() {
        let fabric = LoopbackFabric::new();
        let guest = fabric.endpoint(PeerId(2), "guest");
        assert!(matches!(
            guest.connect(PeerId(1), 0),
            Err(RelayError::Unavailable(_))
        ));
    }

    #[test]
    fn test_socket_handshake_and_delivery() {
        let fabric = LoopbackFabric::new();
        let host = fabric.endpoint(PeerId(1), "host");
        let guest = fabric.endpoint(PeerId(2), "guest");
        let host_events = host.subscribe_status(8);
        let guest_events = guest.subscribe_status(8);

        host.create_listen_socket(7).unwrap();
        let outbound = guest.connect(PeerId(1), 7).unwrap();
        let incoming = host_events.try_recv().unwrap();
        assert_eq!(incoming.state, ConnectionState::Connecting);
        assert_eq!(incoming.remote, PeerId(2));
        assert!(incoming.listen.is_some());

        // Sending before accept is refused.
        assert!(guest.send(outbound, b"early", Delivery::Reliable).is_err());

        host.accept(incoming.conn).unwrap();
        let states: Vec<_> = guest_events.try_iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );

        guest.send(outbound, b"one", Delivery::Reliable).unwrap();
        guest.send(outbound, b"two", Delivery::Unreliable).unwrap();
        assert_eq!(
            host.receive(incoming.conn, 10),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[test]
    fn test_socket_close_notifies_other_side_once() {
        let fabric = LoopbackFabric::new();
        let host = fabric.endpoint(PeerId(1), "host");
        let guest = fabric.endpoint(PeerId(2), "guest");
        let host_events = host.subscribe_status(8);
        host.create_listen_socket(0).unwrap();
        let outbound = guest.connect(PeerId(1), 0).unwrap();
        let incoming = host_events.try_recv().unwrap().conn;
        host.accept(incoming).unwrap();
        host_events.try_iter().for_each(drop);

        guest.close(outbound, "bye");
        guest.close(outbound, "bye");
        let closed: Vec<_> = host_events.try_iter().collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].state, ConnectionState::ClosedByPeer);
        assert_eq!(closed[0].reason, "bye");
    }

    #[test]
    fn test_backlog_past_capacity_is_kept() {
        let fabric = LoopbackFabric::new();
        let host = fabric.endpoint(PeerId(1), "host");
        let events = host.subscribe_status(1);
        host.create_listen_socket(0).unwrap();
        for id in 2..6 {
            let guest = fabric.endpoint(PeerId(id), "guest");
            guest.connect(PeerId(1), 0).unwrap();
        }
        let remotes: Vec<_> = events.try_iter().map(|e| e.remote).collect();
        assert_eq!(remotes, vec![PeerId(2), PeerId(3), PeerId(4), PeerId(5)]);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let fabric = LoopbackFabric::new();
        let host = fabric.endpoint(PeerId(1), "host");
        drop(host.subscribe_status(1));
        let live = host.subscribe_status(1);
        host.create_listen_socket(0).unwrap();
        fabric.endpoint(PeerId(2), "guest").connect(PeerId(1), 0).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(lock(&fabric.state).status_subs[&PeerId(1)].len(), 1);
    }

    #[test]
    fn test_packet_link_needs_both_sides() {
        let fabric = LoopbackFabric::new();
        let host = fabric.endpoint(PeerId(1), "host");
        let guest = fabric.endpoint(PeerId(2), "guest");
        let host_events = host.subscribe("S", 8);

        guest.accept_connection(PeerId(1), "S").unwrap();
        assert_eq!(
            host_events.try_recv().unwrap(),
            P2pEvent::ConnectionRequested { remote: PeerId(2) }
        );
        assert!(matches!(
            guest.send_packet(PeerId(1), "S", 0, PacketReliability::ReliableOrdered, b"x"),
            Err(RelayError::UnknownPeer(_))
        ));

        host.accept_connection(PeerId(2), "S").unwrap();
        assert_eq!(
            host_events.try_recv().unwrap(),
            P2pEvent::ConnectionEstablished { remote: PeerId(2) }
        );
        guest
            .send_packet(PeerId(1), "S", 0, PacketReliability::ReliableOrdered, b"x")
            .unwrap();
        let packet = host.receive_packet("S", PeerId(2)).unwrap();
        assert_eq!(packet.bytes, b"x");
        assert!(host.receive_packet("S", PeerId(2)).is_none());
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let fabric = LoopbackFabric::with_max_packet_size(8);
        let host = fabric.endpoint(PeerId(1), "host");
        let guest = fabric.endpoint(PeerId(2), "guest");
        guest.accept_connection(PeerId(1), "S").unwrap();
        host.accept_connection(PeerId(2), "S").unwrap();
        assert!(matches!(
            guest.send_packet(PeerId(1), "S", 0, PacketReliability::ReliableOrdered, &[0; 9]),
            Err(RelayError::Rejected(_))
        ));
    }

    #[test]
    fn test_owner_leaving_removes_lobby() {
        let fabric = LoopbackFabric::new();
        let host = fabric.endpoint(PeerId(1), "host");
        let guest = fabric.endpoint(PeerId(2), "guest");
        let id = host.create_lobby(4).unwrap();
        assert_eq!(guest.join_lobby(&id).unwrap(), PeerId(1));
        let guest_events = guest.lobby_events(4);

        host.leave_lobby(&id);
        assert_eq!(
            guest_events.try_recv().unwrap(),
            LobbyServiceEvent::MemberLeft {
                lobby: id.clone(),
                member: PeerId(1)
            }
        );
        assert!(host.lobby_owner(&id).is_none());
        assert!(matches!(
            guest.join_lobby(&id),
            Err(RelayError::NoSuchLobby(_))
        ));
    }
}
