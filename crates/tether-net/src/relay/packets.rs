//! Packet-oriented relay transport.
//!
//! Modelled on relay SDKs that address peers by account id plus a socket
//! name rather than by connection handle. Both sides call
//! `accept_connection` for the other; the SDK reports the link as
//! established once both have. Packets have a hard size limit, so larger
//! messages are fragmented here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Receiver;
use tether_config::RelayConfig;

use crate::connection::{Connection, Delivery, SendError};
use crate::peer::{HostAddress, PeerId};
use crate::relay::RelayError;
use crate::transport::{ClientTransport, ServerTransport, TransportError, TransportEvent};

/// Channel all game traffic is sent on.
pub const GAME_CHANNEL: u8 = 0;

/// Fragment header values (first byte of every packet).
const FRAG_WHOLE: u8 = 0;
const FRAG_MORE: u8 = 1;
const FRAG_LAST: u8 = 2;

/// Largest reassembled message accepted from a peer.
pub const MAX_MESSAGE_LEN: usize = 10 * 1024 * 1024;

/// Raw packets pulled from one peer per poll, whole or fragment. A message
/// bigger than this many fragments completes over several polls.
pub const MAX_PACKETS_PER_POLL: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketReliability {
    UnreliableUnordered,
    ReliableOrdered,
}

impl From<Delivery> for PacketReliability {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Reliable => Self::ReliableOrdered,
            Delivery::Unreliable => Self::UnreliableUnordered,
        }
    }
}

/// Connection lifecycle notification for one socket name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum P2pEvent {
    ConnectionRequested { remote: PeerId },
    ConnectionEstablished { remote: PeerId },
    ConnectionClosed { remote: PeerId, reason: String },
}

#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub from: PeerId,
    pub channel: u8,
    pub bytes: Vec<u8>,
}

/// The SDK surface this transport needs.
pub trait PacketsRelayApi: Send + Sync {
    fn local_user(&self) -> PeerId;

    /// Register for lifecycle events on `socket`. Events are never dropped;
    /// a backlog growing past `capacity` is reported.
    fn subscribe(&self, socket: &str, capacity: usize) -> Receiver<P2pEvent>;

    fn accept_connection(&self, remote: PeerId, socket: &str) -> Result<(), RelayError>;

    fn close_connection(&self, remote: PeerId, socket: &str);

    fn send_packet(
        &self,
        remote: PeerId,
        socket: &str,
        channel: u8,
        reliability: PacketReliability,
        bytes: &[u8],
    ) -> Result<(), RelayError>;

    /// Pop the next packet on `socket` from `from`.
    fn receive_packet(&self, socket: &str, from: PeerId) -> Option<ReceivedPacket>;

    fn max_packet_size(&self) -> usize;
}

/// Split `bytes` into packets of at most `max_packet` bytes, header included.
pub fn fragment(bytes: &[u8], max_packet: usize) -> Vec<Vec<u8>> {
    let body = max_packet.saturating_sub(1).max(1);
    if bytes.len() <= body {
        let mut packet = Vec::with_capacity(bytes.len() + 1);
        packet.push(FRAG_WHOLE);
        packet.extend_from_slice(bytes);
        return vec![packet];
    }

    let mut chunks = bytes.chunks(body).peekable();
    let mut packets = Vec::new();
    while let Some(chunk) = chunks.next() {
        let header = if chunks.peek().is_some() {
            FRAG_MORE
        } else {
            FRAG_LAST
        };
        let mut packet = Vec::with_capacity(chunk.len() + 1);
        packet.push(header);
        packet.extend_from_slice(chunk);
        packets.push(packet);
    }
    packets
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("empty packet")]
    Empty,
    #[error("unknown fragment header {0}")]
    BadHeader(u8),
    #[error("reassembled message exceeds {MAX_MESSAGE_LEN} bytes")]
    TooLarge,
}

/// Per-peer reassembly of fragmented messages.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<PeerId, Vec<u8>>,
}

impl Reassembler {
    /// Feed one packet. Returns a message once its last fragment arrives.
    pub fn push(&mut self, from: PeerId, packet: &[u8]) -> Result<Option<Vec<u8>>, FragmentError> {
        let (&header, body) = packet.split_first().ok_or(FragmentError::Empty)?;
        match header {
            FRAG_WHOLE => Ok(Some(body.to_vec())),
            FRAG_MORE | FRAG_LAST => {
                let buf = self.partial.entry(from).or_default();
                if buf.len() + body.len() > MAX_MESSAGE_LEN {
                    self.partial.remove(&from);
                    return Err(FragmentError::TooLarge);
                }
                buf.extend_from_slice(body);
                if header == FRAG_LAST {
                    Ok(self.partial.remove(&from))
                } else {
                    Ok(None)
                }
            }
            other => {
                self.partial.remove(&from);
                Err(FragmentError::BadHeader(other))
            }
        }
    }

    pub fn forget(&mut self, peer: PeerId) {
        self.partial.remove(&peer);
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

/// [`Connection`] to one remote user on one socket name.
pub struct PacketsRelayConnection {
    api: Arc<dyn PacketsRelayApi>,
    remote: PeerId,
    socket: String,
    valid: AtomicBool,
}

impl PacketsRelayConnection {
    fn new(api: Arc<dyn PacketsRelayApi>, remote: PeerId, socket: &str) -> Self {
        Self {
            api,
            remote,
            socket: socket.to_string(),
            valid: AtomicBool::new(true),
        }
    }

    fn close(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            self.api.close_connection(self.remote, &self.socket);
        }
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

impl fmt::Debug for PacketsRelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketsRelayConnection")
            .field("remote", &self.remote)
            .field("socket", &self.socket)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl Connection for PacketsRelayConnection {
    fn peer_id(&self) -> PeerId {
        self.remote
    }

    fn send(&self, bytes: &[u8], delivery: Delivery) -> Result<(), SendError> {
        if !self.is_valid() {
            return Err(SendError::Closed(self.remote));
        }
        if bytes.len() > MAX_MESSAGE_LEN {
            return Err(SendError::TooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_LEN,
            });
        }

        let packets = fragment(bytes, self.api.max_packet_size());
        // Fragments must all arrive, in order.
        let reliability = if packets.len() > 1 {
            if delivery == Delivery::Unreliable {
                tracing::trace!(
                    "Promoting {} byte unreliable message to {} to reliable",
                    bytes.len(),
                    self.remote
                );
            }
            PacketReliability::ReliableOrdered
        } else {
            delivery.into()
        };

        for packet in &packets {
            self.api
                .send_packet(self.remote, &self.socket, GAME_CHANNEL, reliability, packet)?;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn debug_name(&self) -> String {
        format!("relay-b:{}@{}", self.remote, self.socket)
    }
}

/// Drain up to `max_messages` complete messages from `from`, pulling at
/// most [`MAX_PACKETS_PER_POLL`] packets.
fn drain_peer(
    api: &dyn PacketsRelayApi,
    socket: &str,
    from: PeerId,
    max_messages: usize,
    reassembler: &mut Reassembler,
    events: &mut Vec<TransportEvent>,
) {
    let mut delivered = 0;
    let mut pulled = 0;
    while delivered < max_messages && pulled < MAX_PACKETS_PER_POLL {
        pulled += 1;
        let Some(packet) = api.receive_packet(socket, from) else {
            break;
        };
        match reassembler.push(from, &packet.bytes) {
            Ok(Some(bytes)) => {
                delivered += 1;
                events.push(TransportEvent::Message { from, bytes });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Discarding packet from {from}: {e}"),
        }
    }
}

/// Host role over [`PacketsRelayApi`].
pub struct PacketsRelayServer {
    api: Arc<dyn PacketsRelayApi>,
    socket: String,
    event_capacity: usize,
    events: Option<Receiver<P2pEvent>>,
    started: bool,
    connections: HashMap<PeerId, Arc<PacketsRelayConnection>>,
    reassembler: Reassembler,
}

impl PacketsRelayServer {
    pub fn new(api: Arc<dyn PacketsRelayApi>, config: &RelayConfig) -> Self {
        Self {
            api,
            socket: config.socket_name.clone(),
            event_capacity: config.event_queue_capacity,
            events: None,
            started: false,
            connections: HashMap::new(),
            reassembler: Reassembler::default(),
        }
    }
}

impl ServerTransport for PacketsRelayServer {
    fn prepare(&mut self) -> Result<(), TransportError> {
        self.events = Some(self.api.subscribe(&self.socket, self.event_capacity));
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransportError> {
        if self.events.is_none() {
            return Err(TransportError::NotPrepared);
        }
        self.started = true;
        tracing::info!("Relay host accepting on socket {:?}", self.socket);
        Ok(())
    }

    fn stop(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.close();
        }
        self.reassembler.clear();
        self.events = None;
        self.started = false;
    }

    fn local_identity(&self) -> PeerId {
        self.api.local_user()
    }

    fn poll(&mut self, max_per_peer: usize, events: &mut Vec<TransportEvent>) {
        if !self.started {
            return;
        }
        let lifecycle: Vec<_> = match &self.events {
            Some(rx) => rx.try_iter().collect(),
            None => return,
        };

        for event in lifecycle {
            match event {
                P2pEvent::ConnectionRequested { remote } => {
                    tracing::info!("Accepting relay connection from {remote}");
                    if let Err(e) = self.api.accept_connection(remote, &self.socket) {
                        tracing::warn!("Failed to accept {remote}: {e}");
                    }
                }
                P2pEvent::ConnectionEstablished { remote } => {
                    let conn = Arc::new(PacketsRelayConnection::new(
                        Arc::clone(&self.api),
                        remote,
                        &self.socket,
                    ));
                    match self.connections.insert(remote, conn) {
                        None => events.push(TransportEvent::PeerConnected(remote)),
                        Some(stale) => {
                            // Same link re-established; the old handle must not be reused.
                            stale.invalidate();
                            self.reassembler.forget(remote);
                            tracing::debug!("Relay link to {remote} re-established");
                        }
                    }
                }
                P2pEvent::ConnectionClosed { remote, reason } => {
                    if let Some(conn) = self.connections.remove(&remote) {
                        conn.invalidate();
                        self.reassembler.forget(remote);
                        tracing::info!("Relay peer {remote} disconnected: {reason}");
                        events.push(TransportEvent::PeerDisconnected {
                            peer: remote,
                            reason,
                        });
                    }
                }
            }
        }

        let peers: Vec<PeerId> = self.connections.keys().copied().collect();
        for peer in peers {
            drain_peer(
                self.api.as_ref(),
                &self.socket,
                peer,
                max_per_peer,
                &mut self.reassembler,
                events,
            );
        }
    }

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections
            .values()
            .map(|c| Arc::clone(c) as Arc<dyn Connection>)
            .collect()
    }

    fn connection(&self, peer: PeerId) -> Option<Arc<dyn Connection>> {
        self.connections
            .get(&peer)
            .map(|c| Arc::clone(c) as Arc<dyn Connection>)
    }

    fn disconnect(&mut self, peer: PeerId) {
        if let Some(conn) = self.connections.remove(&peer) {
            conn.close();
            self.reassembler.forget(peer);
        }
    }
}

/// Client role over [`PacketsRelayApi`].
pub struct PacketsRelayClient {
    api: Arc<dyn PacketsRelayApi>,
    socket: String,
    event_capacity: usize,
    events: Option<Receiver<P2pEvent>>,
    host: Option<PeerId>,
    connection: Option<Arc<PacketsRelayConnection>>,
    reassembler: Reassembler,
}

impl PacketsRelayClient {
    pub fn new(api: Arc<dyn PacketsRelayApi>, config: &RelayConfig) -> Self {
        Self {
            api,
            socket: config.socket_name.clone(),
            event_capacity: config.event_queue_capacity,
            events: None,
            host: None,
            connection: None,
            reassembler: Reassembler::default(),
        }
    }
}

impl ClientTransport for PacketsRelayClient {
    fn connect(&mut self, host: HostAddress) -> Result<(), TransportError> {
        let HostAddress::Relay(remote) = host else {
            return Err(TransportError::UnsupportedAddress(host));
        };
        self.disconnect();

        self.events = Some(self.api.subscribe(&self.socket, self.event_capacity));
        if let Err(e) = self.api.accept_connection(remote, &self.socket) {
            self.events = None;
            return Err(e.into());
        }
        tracing::info!("Connecting to relay host {remote}");
        self.host = Some(remote);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close();
        } else if let Some(host) = self.host {
            self.api.close_connection(host, &self.socket);
        }
        self.host = None;
        self.events = None;
        self.reassembler.clear();
    }

    fn poll(&mut self, max_per_peer: usize, events: &mut Vec<TransportEvent>) {
        let Some(host) = self.host else {
            return;
        };
        let lifecycle: Vec<_> = match &self.events {
            Some(rx) => rx.try_iter().collect(),
            None => return,
        };

        for event in lifecycle {
            match event {
                P2pEvent::ConnectionEstablished { remote } if remote == host => {
                    let conn = Arc::new(PacketsRelayConnection::new(
                        Arc::clone(&self.api),
                        host,
                        &self.socket,
                    ));
                    match self.connection.replace(conn) {
                        None => events.push(TransportEvent::HostReachable),
                        Some(stale) => {
                            stale.invalidate();
                            self.reassembler.clear();
                            tracing::debug!("Relay link to host {host} re-established");
                        }
                    }
                }
                P2pEvent::ConnectionClosed { remote, reason } if remote == host => {
                    if let Some(conn) = self.connection.take() {
                        conn.invalidate();
                    }
                    self.host = None;
                    self.events = None;
                    self.reassembler.clear();
                    events.push(TransportEvent::HostLost(reason));
                    return;
                }
                P2pEvent::ConnectionRequested { remote } => {
                    tracing::debug!("Ignoring connection request from {remote} while a client");
                }
                _ => {}
            }
        }

        if self.connection.is_some() {
            drain_peer(
                self.api.as_ref(),
                &self.socket,
                host,
                max_per_peer,
                &mut self.reassembler,
                events,
            );
        }
    }

    fn host_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection
            .as_ref()
            .filter(|c| c.is_valid())
            .map(|c| Arc::clone(c) as Arc<dyn Connection>)
    }

    fn local_identity(&self) -> PeerId {
        self.api.local_user()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::LoopbackFabric;

    fn connected_pair(max_packet: usize) -> (PacketsRelayServer, PacketsRelayClient) {
        let fabric = LoopbackFabric::with_max_packet_size(max_packet);
        let config = RelayConfig::default();
        let mut server = PacketsRelayServer::new(fabric.endpoint(PeerId(1), "host"), &config);
        let mut client = PacketsRelayClient::new(fabric.endpoint(PeerId(2), "guest"), &config);
        server.prepare().unwrap();
        server.start().unwrap();
        client.connect(HostAddress::Relay(PeerId(1))).unwrap();

        let mut s = Vec::new();
        let mut c = Vec::new();
        for _ in 0..3 {
            server.poll(128, &mut s);
            client.poll(128, &mut c);
        }
        assert!(s.iter().any(|e| matches!(e, TransportEvent::PeerConnected(p) if *p == PeerId(2))));
        assert!(c.iter().any(|e| matches!(e, TransportEvent::HostReachable)));
        (server, client)
    }

    fn messages(events: &[TransportEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Message { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_fragment_small_message_is_whole() {
        let packets = fragment(b"abc", 16);
        assert_eq!(packets, vec![vec![FRAG_WHOLE, b'a', b'b', b'c']]);
    }

    #[test]
    fn test_fragment_respects_packet_limit() {
        let data: Vec<u8> = (0..100).collect();
        let packets = fragment(&data, 10);
        assert_eq!(packets.len(), 12);
        assert!(packets.iter().all(|p| p.len() <= 10));
        assert!(packets[..11].iter().all(|p| p[0] == FRAG_MORE));
        assert_eq!(packets[11][0], FRAG_LAST);
    }

    #[test]
    fn test_reassembler_rejects_bad_header() {
        let mut r = Reassembler::default();
        assert_eq!(r.push(PeerId(1), &[9, 1, 2]), Err(FragmentError::BadHeader(9)));
        assert_eq!(r.push(PeerId(1), &[]), Err(FragmentError::Empty));
    }

    #[test]
    fn test_reassembler_keeps_peers_apart() {
        let mut r = Reassembler::default();
        assert_eq!(r.push(PeerId(1), &[FRAG_MORE, 1]), Ok(None));
        assert_eq!(r.push(PeerId(2), &[FRAG_MORE, 9]), Ok(None));
        assert_eq!(r.push(PeerId(1), &[FRAG_LAST, 2]), Ok(Some(vec![1, 2])));
        assert_eq!(r.push(PeerId(2), &[FRAG_LAST, 8]), Ok(Some(vec![9, 8])));
    }

    #[test]
    fn test_large_message_is_fragmented_and_reassembled() {
        let (mut server, client) = connected_pair(64);
        let big: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        client
            .host_connection()
            .unwrap()
            .send(&big, Delivery::Unreliable)
            .unwrap();

        let mut events = Vec::new();
        server.poll(128, &mut events);
        assert_eq!(messages(&events), vec![big]);
    }

    #[test]
    fn test_drain_cap_counts_whole_messages() {
        let (mut server, client) = connected_pair(1170);
        let conn = client.host_connection().unwrap();
        for i in 0..5u8 {
            conn.send(&[i], Delivery::Reliable).unwrap();
        }

        let mut events = Vec::new();
        server.poll(2, &mut events);
        assert_eq!(messages(&events), vec![vec![0], vec![1]]);
        events.clear();
        server.poll(2, &mut events);
        assert_eq!(messages(&events), vec![vec![2], vec![3]]);
    }

    #[test]
    fn test_reassembly_past_limit_resets_buffer() {
        let mut r = Reassembler::default();
        let mut chunk = vec![FRAG_MORE];
        chunk.resize(1024 * 1024 + 1, 0);
        let mut result = Ok(None);
        for _ in 0..=(MAX_MESSAGE_LEN / (1024 * 1024)) {
            result = r.push(PeerId(1), &chunk);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(FragmentError::TooLarge));
        assert_eq!(r.push(PeerId(1), &[FRAG_LAST, 7]), Ok(Some(vec![7])));
    }

    #[test]
    fn test_fragment_stream_is_pulled_in_bounded_batches() {
        let fabric = LoopbackFabric::new();
        let host = fabric.endpoint(PeerId(1), "host");
        let guest = fabric.endpoint(PeerId(2), "guest");
        let config = RelayConfig::default();
        let mut server = PacketsRelayServer::new(host.clone(), &config);
        let mut client = PacketsRelayClient::new(guest.clone(), &config);
        server.prepare().unwrap();
        server.start().unwrap();
        client.connect(HostAddress::Relay(PeerId(1))).unwrap();
        let mut scratch = Vec::new();
        for _ in 0..3 {
            server.poll(128, &mut scratch);
            client.poll(128, &mut scratch);
        }

        // A message that never finishes.
        let socket = config.socket_name.as_str();
        for _ in 0..MAX_PACKETS_PER_POLL + 10 {
            guest
                .send_packet(
                    PeerId(1),
                    socket,
                    GAME_CHANNEL,
                    PacketReliability::ReliableOrdered,
                    &[FRAG_MORE, 0],
                )
                .unwrap();
        }

        let mut events = Vec::new();
        server.poll(128, &mut events);
        assert!(messages(&events).is_empty());
        let left = std::iter::from_fn(|| host.receive_packet(socket, PeerId(2))).count();
        assert_eq!(left, 10);
    }

    #[test]
    fn test_repeated_establish_retires_old_handle() {
        let fabric = LoopbackFabric::new();
        let config = RelayConfig::default();
        let mut server = PacketsRelayServer::new(fabric.endpoint(PeerId(1), "host"), &config);
        server.prepare().unwrap();
        server.start().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        server.events = Some(rx);

        tx.send(P2pEvent::ConnectionEstablished { remote: PeerId(2) }).unwrap();
        let mut events = Vec::new();
        server.poll(128, &mut events);
        let first = server.connection(PeerId(2)).unwrap();

        tx.send(P2pEvent::ConnectionEstablished { remote: PeerId(2) }).unwrap();
        server.poll(128, &mut events);

        let connected = events
            .iter()
            .filter(|e| matches!(e, TransportEvent::PeerConnected(_)))
            .count();
        assert_eq!(connected, 1);
        assert!(!first.is_valid());
        assert!(server.connection(PeerId(2)).unwrap().is_valid());
    }

    #[test]
    fn test_host_sends_to_client() {
        let (server, mut client) = connected_pair(1170);
        server
            .connection(PeerId(2))
            .unwrap()
            .send(b"welcome", Delivery::Reliable)
            .unwrap();
        let mut events = Vec::new();
        client.poll(128, &mut events);
        assert_eq!(messages(&events), vec![b"welcome".to_vec()]);
    }

    #[test]
    fn test_client_disconnect_reaches_server() {
        let (mut server, mut client) = connected_pair(1170);
        client.disconnect();
        let mut events = Vec::new();
        server.poll(128, &mut events);
        assert!(events.iter().any(|e| matches!(e, TransportEvent::PeerDisconnected { peer, .. } if *peer == PeerId(2))));
        assert!(server.connections().is_empty());
    }
}
