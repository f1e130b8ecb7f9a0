//! Raw-socket host: an accept task plus one reader/writer task pair per client.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tether_config::DirectConfig;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use crate::connection::Connection;
use crate::peer::PeerId;
use crate::transport::socket::{SocketConfig, configure_stream, create_listener};
use crate::transport::tcp::{SocketEvent, TcpConnection};
use crate::transport::{ServerTransport, TransportError, TransportEvent};

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Frames one peer may have waiting past its per-tick cap before it is dropped.
pub const MAX_PEER_BACKLOG: usize = 4096;

/// Generated identifiers live above every endpoint-derived IPv4 id and
/// below the IPv6 range.
const GENERATED_ID_BASE: u64 = 1 << 62;

/// Fallback [`PeerId`]s for sockets whose remote endpoint is unavailable.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> PeerId {
        PeerId(GENERATED_ID_BASE | self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Connected clients, shared between the accept task and the game thread.
pub type ConnectionMap = DashMap<PeerId, Arc<TcpConnection>>;

/// A socket event held back for a later poll, in arrival order per peer.
#[derive(Debug)]
enum Held {
    Opened,
    Frame(Vec<u8>),
    Closed(String),
}

/// Per-peer queues of events that did not fit in a poll.
#[derive(Debug, Default)]
struct Backlog {
    queues: HashMap<PeerId, VecDeque<Held>>,
}

impl Backlog {
    fn push(&mut self, peer: PeerId, held: Held) {
        self.queues.entry(peer).or_default().push_back(held);
    }

    fn peers(&self) -> Vec<PeerId> {
        self.queues.keys().copied().collect()
    }

    fn frames(&self, peer: PeerId) -> usize {
        self.queues.get(&peer).map_or(0, |q| {
            q.iter().filter(|h| matches!(h, Held::Frame(_))).count()
        })
    }

    /// Drop the frames still held for `peer`, keeping lifecycle events.
    fn discard_frames(&mut self, peer: PeerId) {
        if let Some(queue) = self.queues.get_mut(&peer) {
            queue.retain(|h| !matches!(h, Held::Frame(_)));
        }
    }

    fn clear(&mut self) {
        self.queues.clear();
    }
}

/// Raw-socket [`ServerTransport`].
pub struct TcpServer {
    bind_address: String,
    advertise_address: String,
    port: u16,
    max_connections: usize,
    socket_config: SocketConfig,
    handle: Handle,
    listener: Option<std::net::TcpListener>,
    local_addr: Option<SocketAddr>,
    connections: Arc<ConnectionMap>,
    id_gen: Arc<IdGenerator>,
    events_tx: mpsc::Sender<SocketEvent>,
    events_rx: mpsc::Receiver<SocketEvent>,
    backlog: Backlog,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl TcpServer {
    /// Create an idle server. Socket tasks run on `handle`.
    pub fn new(config: &DirectConfig, handle: Handle) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.inbound_queue.max(1));
        Self {
            bind_address: config.bind_address.clone(),
            advertise_address: config.advertise_address.clone(),
            port: config.port,
            max_connections: config.max_connections,
            socket_config: SocketConfig::default(),
            handle,
            listener: None,
            local_addr: None,
            connections: Arc::new(DashMap::new()),
            id_gen: Arc::new(IdGenerator::new()),
            events_tx,
            events_rx,
            backlog: Backlog::default(),
            shutdown_tx: None,
        }
    }

    fn parse_ip(address: &str) -> Result<IpAddr, TransportError> {
        address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))
    }

    /// Emit what `peer` has held, in order, until its frame budget is spent.
    /// Lifecycle events never count against the budget.
    fn release(
        &mut self,
        peer: PeerId,
        max_per_peer: usize,
        taken: &mut HashMap<PeerId, usize>,
        events: &mut Vec<TransportEvent>,
    ) {
        let Some(queue) = self.backlog.queues.get_mut(&peer) else {
            return;
        };
        let count = taken.entry(peer).or_insert(0);
        while let Some(front) = queue.front() {
            if matches!(front, Held::Frame(_)) && *count >= max_per_peer {
                break;
            }
            match queue.pop_front() {
                Some(Held::Opened) => events.push(TransportEvent::PeerConnected(peer)),
                Some(Held::Frame(bytes)) => {
                    *count += 1;
                    events.push(TransportEvent::Message { from: peer, bytes });
                }
                Some(Held::Closed(reason)) => {
                    // A reconnect may already have replaced the entry.
                    self.connections.remove_if(&peer, |_, c| !c.is_valid());
                    tracing::info!("Connection {peer} closed: {reason}");
                    events.push(TransportEvent::PeerDisconnected { peer, reason });
                }
                None => break,
            }
        }
        if queue.is_empty() {
            self.backlog.queues.remove(&peer);
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        ctx: AcceptContext,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, remote)) => ctx.admit(stream, remote).await,
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Accept loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// State the accept task needs for each new socket.
struct AcceptContext {
    handle: Handle,
    connections: Arc<ConnectionMap>,
    id_gen: Arc<IdGenerator>,
    events: mpsc::Sender<SocketEvent>,
    socket_config: SocketConfig,
    max_connections: usize,
}

impl AcceptContext {
    async fn admit(&self, stream: tokio::net::TcpStream, remote: SocketAddr) {
        if self.connections.len() >= self.max_connections {
            tracing::warn!("Connection limit reached, rejecting {remote}");
            return;
        }

        let peer = stream
            .peer_addr()
            .map(PeerId::from_endpoint)
            .unwrap_or_else(|_| self.id_gen.next_id());

        if let Err(e) = configure_stream(&stream, &self.socket_config) {
            tracing::debug!("Could not configure socket for {remote}: {e}");
        }

        // Registered before the open event so the game thread can always
        // resolve a peer it has heard from.
        let connections = &self.connections;
        let opened = TcpConnection::open(
            &self.handle,
            stream,
            peer,
            remote,
            self.events.clone(),
            |conn| {
                if let Some(stale) = connections.insert(peer, Arc::clone(conn)) {
                    stale.close();
                }
            },
        )
        .await;

        match opened {
            Some(_) => tracing::info!("Accepted connection {peer} from {remote}"),
            None => {
                connections.remove_if(&peer, |_, c| !c.is_valid());
            }
        }
    }
}

impl ServerTransport for TcpServer {
    fn prepare(&mut self) -> Result<(), TransportError> {
        let ip = Self::parse_ip(&self.bind_address)?;
        let addr = SocketAddr::new(ip, self.port);
        let listener = create_listener(addr, &self.socket_config)
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        tracing::info!("Server listening on {local_addr}");
        self.local_addr = Some(local_addr);
        self.listener = Some(listener);
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let std_listener = self.listener.take().ok_or(TransportError::NotPrepared)?;
        let addr = self.local_addr.ok_or(TransportError::NotPrepared)?;

        let listener = {
            let _guard = self.handle.enter();
            TcpListener::from_std(std_listener)
                .map_err(|source| TransportError::Bind { addr, source })?
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = AcceptContext {
            handle: self.handle.clone(),
            connections: Arc::clone(&self.connections),
            id_gen: Arc::clone(&self.id_gen),
            events: self.events_tx.clone(),
            socket_config: self.socket_config.clone(),
            max_connections: self.max_connections,
        };
        self.handle
            .spawn(Self::accept_loop(listener, ctx, shutdown_rx));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
        self.listener = None;
        self.backlog.clear();
        while self.events_rx.try_recv().is_ok() {}
    }

    /// Resolves port 0 once prepared.
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn local_identity(&self) -> PeerId {
        let port = self.local_addr.map_or(self.port, |a| a.port());
        match Self::parse_ip(&self.advertise_address) {
            Ok(ip) => PeerId::from_endpoint(SocketAddr::new(ip, port)),
            Err(_) => self
                .local_addr
                .map_or(PeerId::UNASSIGNED, PeerId::from_endpoint),
        }
    }

    /// Delivers at most `max_per_peer` messages from each peer. The rest
    /// stay queued for the next poll; a peer whose held frames pass
    /// [`MAX_PEER_BACKLOG`] is aborted.
    fn poll(&mut self, max_per_peer: usize, events: &mut Vec<TransportEvent>) {
        let mut taken = HashMap::new();
        for peer in self.backlog.peers() {
            self.release(peer, max_per_peer, &mut taken, events);
        }

        // Only what is queued right now; later arrivals wait for the next tick.
        for _ in 0..self.events_rx.len() {
            let Ok(event) = self.events_rx.try_recv() else {
                break;
            };
            let (peer, held) = match event {
                SocketEvent::Opened(conn) => (conn.peer_id(), Held::Opened),
                SocketEvent::Frame { from, bytes } => (from, Held::Frame(bytes)),
                SocketEvent::Closed { peer, reason } => (peer, Held::Closed(reason)),
                SocketEvent::ConnectFailed(e) => {
                    tracing::debug!("Ignoring client-side event on server: {e}");
                    continue;
                }
            };
            self.backlog.push(peer, held);
            self.release(peer, max_per_peer, &mut taken, events);
        }

        for peer in self.backlog.peers() {
            if self.backlog.frames(peer) <= MAX_PEER_BACKLOG {
                continue;
            }
            tracing::warn!("Peer {peer} exceeded its inbound backlog, dropping it");
            self.backlog.discard_frames(peer);
            if let Some(conn) = self.connections.get(&peer) {
                conn.abort("inbound backlog exceeded");
            }
        }
    }

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()) as Arc<dyn Connection>)
            .collect()
    }

    fn connection(&self, peer: PeerId) -> Option<Arc<dyn Connection>> {
        self.connections
            .get(&peer)
            .map(|entry| Arc::clone(entry.value()) as Arc<dyn Connection>)
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.backlog.discard_frames(peer);
        if let Some((_, conn)) = self.connections.remove(&peer) {
            conn.close();
            tracing::info!("Disconnected {peer}");
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Delivery;
    use crate::framing::{read_frame, write_frame};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(max_connections: usize) -> DirectConfig {
        DirectConfig {
            bind_address: "127.0.0.1".to_string(),
            advertise_address: "127.0.0.1".to_string(),
            port: 0,
            max_connections,
            inbound_queue: 64,
        }
    }

    fn start_test_server(max_connections: usize) -> (TcpServer, SocketAddr) {
        let mut server = TcpServer::new(&test_config(max_connections), Handle::current());
        server.prepare().unwrap();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    /// Poll until `count` events matching `pred` have been seen.
    async fn poll_for(
        server: &mut TcpServer,
        count: usize,
        pred: impl Fn(&TransportEvent) -> bool,
    ) -> Vec<TransportEvent> {
        let mut seen = Vec::new();
        for _ in 0..200 {
            let mut events = Vec::new();
            server.poll(usize::MAX, &mut events);
            seen.extend(events);
            if seen.iter().filter(|e| pred(e)).count() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for events, saw {seen:?}");
    }

    fn is_connect(e: &TransportEvent) -> bool {
        matches!(e, TransportEvent::PeerConnected(_))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accepts_connection_and_derives_endpoint_id() {
        let (mut server, addr) = start_test_server(16);
        let client = TcpStream::connect(addr).await.unwrap();
        let expected = PeerId::from_endpoint(client.local_addr().unwrap());

        let events = poll_for(&mut server, 1, is_connect).await;
        assert!(matches!(events[0], TransportEvent::PeerConnected(id) if id == expected));
        assert_eq!(server.connections().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_max_connections_enforced() {
        let (mut server, addr) = start_test_server(2);
        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        poll_for(&mut server, 2, is_connect).await;

        let _c3 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut events = Vec::new();
        server.poll(usize::MAX, &mut events);
        assert!(events.iter().all(|e| !is_connect(e)));
        assert_eq!(server.connections().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_broadcast_reaches_every_client_once() {
        const N: usize = 8;
        let (mut server, addr) = start_test_server(32);
        let mut clients = Vec::new();
        for _ in 0..N {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        poll_for(&mut server, N, is_connect).await;

        // One client vanishes right before the broadcast.
        let dropped = clients.remove(0);
        drop(dropped);

        let mut delivered = 0;
        for conn in server.connections() {
            if conn.send(b"snapshot", Delivery::Reliable).is_ok() {
                delivered += 1;
            }
        }
        assert!(delivered >= N - 1);

        for client in &mut clients {
            let frame = tokio::time::timeout(Duration::from_secs(2), read_frame(client))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame, b"snapshot");
        }

        // Exactly once: nothing else is waiting on any surviving client.
        for client in &mut clients {
            let mut buf = [0u8; 1];
            let extra =
                tokio::time::timeout(Duration::from_millis(50), client.read(&mut buf)).await;
            assert!(extra.is_err(), "client received more than one frame");
        }
    }

    fn message_bytes(events: &[TransportEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Message { bytes, .. } => Some(bytes[0]),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flooding_peer_is_capped_and_carried_over() {
        let (mut server, addr) = start_test_server(4);
        let mut client = TcpStream::connect(addr).await.unwrap();
        poll_for(&mut server, 1, is_connect).await;

        for i in 0..200u8 {
            write_frame(&mut client, &[i]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut events = Vec::new();
        server.poll(4, &mut events);
        assert_eq!(message_bytes(&events), vec![0, 1, 2, 3]);

        let mut received = message_bytes(&events);
        for _ in 0..500 {
            if received.len() == 200 {
                break;
            }
            let mut events = Vec::new();
            server.poll(4, &mut events);
            let batch = message_bytes(&events);
            assert!(batch.len() <= 4, "poll delivered {} messages", batch.len());
            received.extend(batch);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(received, (0..200u8).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_quiet_peer_is_not_starved_by_a_flooder() {
        let (mut server, addr) = start_test_server(4);
        let mut flooder = TcpStream::connect(addr).await.unwrap();
        let mut quiet = TcpStream::connect(addr).await.unwrap();
        poll_for(&mut server, 2, is_connect).await;
        let quiet_id = PeerId::from_endpoint(quiet.local_addr().unwrap());

        for i in 0..60u8 {
            write_frame(&mut flooder, &[i]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        write_frame(&mut quiet, b"q").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut events = Vec::new();
        server.poll(2, &mut events);
        let from_quiet = events
            .iter()
            .filter(|e| matches!(e, TransportEvent::Message { from, .. } if *from == quiet_id))
            .count();
        assert_eq!(from_quiet, 1);
        assert_eq!(message_bytes(&events).len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unbounded_backlog_drops_the_peer() {
        let (mut server, addr) = start_test_server(4);
        let mut client = TcpStream::connect(addr).await.unwrap();
        poll_for(&mut server, 1, is_connect).await;

        let writer = tokio::spawn(async move {
            for i in 0..(MAX_PEER_BACKLOG + 500) {
                if write_frame(&mut client, &[i as u8]).await.is_err() {
                    break;
                }
            }
            client
        });

        let mut seen = Vec::new();
        for _ in 0..1000 {
            let mut events = Vec::new();
            // Zero budget: every frame is held back.
            server.poll(0, &mut events);
            seen.extend(events);
            if seen.iter().any(|e| matches!(e, TransportEvent::PeerDisconnected { .. })) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(message_bytes(&seen).is_empty());
        assert!(seen.iter().any(|e| matches!(
            e,
            TransportEvent::PeerDisconnected { reason, .. } if reason == "inbound backlog exceeded"
        )));
        assert!(server.connections().is_empty());
        drop(writer.await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inbound_frame_becomes_message() {
        let (mut server, addr) = start_test_server(4);
        let mut client = TcpStream::connect(addr).await.unwrap();
        poll_for(&mut server, 1, is_connect).await;

        write_frame(&mut client, b"hello").await.unwrap();
        let events = poll_for(&mut server, 1, |e| {
            matches!(e, TransportEvent::Message { .. })
        })
        .await;
        assert!(events.iter().any(
            |e| matches!(e, TransportEvent::Message { bytes, .. } if bytes == b"hello")
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_length_drops_connection_without_message() {
        let (mut server, addr) = start_test_server(4);
        let mut client = TcpStream::connect(addr).await.unwrap();
        poll_for(&mut server, 1, is_connect).await;

        client
            .write_all(&(crate::framing::MAX_FRAME_LEN + 1).to_le_bytes())
            .await
            .unwrap();
        let events = poll_for(&mut server, 1, |e| {
            matches!(e, TransportEvent::PeerDisconnected { .. })
        })
        .await;
        assert!(
            events
                .iter()
                .all(|e| !matches!(e, TransportEvent::Message { .. }))
        );
        assert!(server.connections().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_closes_client_sockets() {
        let (mut server, addr) = start_test_server(4);
        let mut client = TcpStream::connect(addr).await.unwrap();
        poll_for(&mut server, 1, is_connect).await;

        server.stop();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "client should see EOF after stop");
        assert!(server.connections().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_without_prepare_fails() {
        let mut server = TcpServer::new(&test_config(4), Handle::current());
        assert!(matches!(server.start(), Err(TransportError::NotPrepared)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prepare_reports_bad_bind_address() {
        let mut config = test_config(4);
        config.bind_address = "not-an-ip".to_string();
        let mut server = TcpServer::new(&config, Handle::current());
        assert!(matches!(
            server.prepare(),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_generated_ids_are_unique_and_tagged() {
        let id_gen = IdGenerator::new();
        let a = id_gen.next_id();
        let b = id_gen.next_id();
        assert_ne!(a, b);
        assert_ne!(a.0 & GENERATED_ID_BASE, 0);
    }
}
