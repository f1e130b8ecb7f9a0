//! Connection-oriented relay transport.
//!
//! Modelled on relay SDKs that hand out per-connection handles: the host
//! opens a listen socket on a virtual port, incoming connections must be
//! explicitly accepted, and every state change arrives as a
//! [`ConnectionStatusChanged`] event.

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

/// SDK handle for one side of a relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnHandle(pub u64);

/// SDK handle for a listen socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound: request in flight. Inbound: waiting for `accept`.
    Connecting,
    Connected,
    ClosedByPeer,
    ProblemDetected,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        matches!(self, Self::ClosedByPeer | Self::ProblemDetected)
    }
}

/// Status callback payload.
#[derive(Debug, Clone)]
pub struct ConnectionStatusChanged {
    pub conn: ConnHandle,
    pub remote: PeerId,
    /// Set when the connection arrived through this listen socket.
    pub listen: Option<ListenHandle>,
    pub state: ConnectionState,
    pub reason: String,
}

/// The SDK surface this transport needs.
pub trait SocketsRelayApi: Send + Sync {
    fn local_identity(&self) -> PeerId;

    fn create_listen_socket(&self, virtual_port: u16) -> Result<ListenHandle, RelayError>;

    fn close_listen_socket(&self, socket: ListenHandle);

    fn connect(&self, remote: PeerId, virtual_port: u16) -> Result<ConnHandle, RelayError>;

    fn accept(&self, conn: ConnHandle) -> Result<(), RelayError>;

    fn close(&self, conn: ConnHandle, reason: &str);

    fn send(&self, conn: ConnHandle, bytes: &[u8], delivery: Delivery) -> Result<(), RelayError>;

    /// Take up to `max` queued messages from `conn`.
    fn receive(&self, conn: ConnHandle, max: usize) -> Vec<Vec<u8>>;

    /// Register for status callbacks. Lifecycle events are never dropped;
    /// a backlog growing past `capacity` is reported.
    fn subscribe_status(&self, capacity: usize) -> Receiver<ConnectionStatusChanged>;
}

/// [`Connection`] over one relay connection handle.
pub struct SocketsRelayConnection {
    api: Arc<dyn SocketsRelayApi>,
    handle: ConnHandle,
    peer: PeerId,
    valid: AtomicBool,
}

impl SocketsRelayConnection {
    fn new(api: Arc<dyn SocketsRelayApi>, handle: ConnHandle, peer: PeerId) -> Self {
        Self {
            api,
            handle,
            peer,
            valid: AtomicBool::new(true),
        }
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    fn close(&self, reason: &str) {
        if self.valid.swap(false, Ordering::AcqRel) {
            self.api.close(self.handle, reason);
        }
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

impl fmt::Debug for SocketsRelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketsRelayConnection")
            .field("handle", &self.handle)
            .field("peer", &self.peer)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl Connection for SocketsRelayConnection {
    fn peer_id(&self) -> PeerId {
        self.peer
    }

    fn send(&self, bytes: &[u8], delivery: Delivery) -> Result<(), SendError> {
        if !self.is_valid() {
            return Err(SendError::Closed(self.peer));
        }
        self.api.send(self.handle, bytes, delivery)?;
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn debug_name(&self) -> String {
        format!("relay-a:{}#{}", self.peer, self.handle.0)
    }
}

/// Host role over [`SocketsRelayApi`].
pub struct SocketsRelayServer {
    api: Arc<dyn SocketsRelayApi>,
    virtual_port: u16,
    event_capacity: usize,
    listen: Option<ListenHandle>,
    status: Option<Receiver<ConnectionStatusChanged>>,
    connections: HashMap<PeerId, Arc<SocketsRelayConnection>>,
}

impl SocketsRelayServer {
    pub fn new(api: Arc<dyn SocketsRelayApi>, config: &RelayConfig) -> Self {
        Self {
            api,
            virtual_port: config.virtual_port,
            event_capacity: config.event_queue_capacity,
            listen: None,
            status: None,
            connections: HashMap::new(),
        }
    }

    fn handle_status(&mut self, change: ConnectionStatusChanged, events: &mut Vec<TransportEvent>) {
        if self.listen.is_none() || change.listen != self.listen {
            return;
        }
        match change.state {
            ConnectionState::Connecting => {
                tracing::info!("Accepting relay connection from {}", change.remote);
                if let Err(e) = self.api.accept(change.conn) {
                    tracing::warn!("Failed to accept relay connection from {}: {e}", change.remote);
                    self.api.close(change.conn, "accept failed");
                }
            }
            ConnectionState::Connected => {
                let conn = Arc::new(SocketsRelayConnection::new(
                    Arc::clone(&self.api),
                    change.conn,
                    change.remote,
                ));
                if let Some(stale) = self.connections.insert(change.remote, conn) {
                    stale.close("replaced");
                }
                events.push(TransportEvent::PeerConnected(change.remote));
            }
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetected => {
                // Only drop the entry if it still refers to this handle.
                let current = self
                    .connections
                    .get(&change.remote)
                    .is_some_and(|c| c.handle == change.conn);
                self.api.close(change.conn, "closed");
                if current {
                    if let Some(conn) = self.connections.remove(&change.remote) {
                        conn.invalidate();
                    }
                    tracing::info!("Relay peer {} disconnected: {}", change.remote, change.reason);
                    events.push(TransportEvent::PeerDisconnected {
                        peer: change.remote,
                        reason: change.reason,
                    });
                }
            }
        }
    }
}

impl ServerTransport for SocketsRelayServer {
    fn prepare(&mut self) -> Result<(), TransportError> {
        // Subscribe first so no request racing the listen socket is missed.
        self.status = Some(self.api.subscribe_status(self.event_capacity));
        match self.api.create_listen_socket(self.virtual_port) {
            Ok(listen) => {
                tracing::info!("Relay listen socket open on virtual port {}", self.virtual_port);
                self.listen = Some(listen);
                Ok(())
            }
            Err(e) => {
                self.status = None;
                Err(e.into())
            }
        }
    }

    fn start(&mut self) -> Result<(), TransportError> {
        if self.listen.is_none() {
            return Err(TransportError::NotPrepared);
        }
        Ok(())
    }

    fn stop(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.close("server stopping");
        }
        if let Some(listen) = self.listen.take() {
            self.api.close_listen_socket(listen);
        }
        self.status = None;
    }

    fn local_identity(&self) -> PeerId {
        self.api.local_identity()
    }

    fn poll(&mut self, max_per_peer: usize, events: &mut Vec<TransportEvent>) {
        let changes: Vec<_> = match &self.status {
            Some(rx) => rx.try_iter().collect(),
            None => return,
        };
        for change in changes {
            self.handle_status(change, events);
        }

        for conn in self.connections.values() {
            for bytes in self.api.receive(conn.handle, max_per_peer) {
                events.push(TransportEvent::Message {
                    from: conn.peer,
                    bytes,
                });
            }
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
            conn.close("kicked");
        }
    }
}

/// Client role over [`SocketsRelayApi`].
pub struct SocketsRelayClient {
    api: Arc<dyn SocketsRelayApi>,
    virtual_port: u16,
    event_capacity: usize,
    status: Option<Receiver<ConnectionStatusChanged>>,
    pending: Option<(ConnHandle, PeerId)>,
    connection: Option<Arc<SocketsRelayConnection>>,
}

impl SocketsRelayClient {
    pub fn new(api: Arc<dyn SocketsRelayApi>, config: &RelayConfig) -> Self {
        Self {
            api,
            virtual_port: config.virtual_port,
            event_capacity: config.event_queue_capacity,
            status: None,
            pending: None,
            connection: None,
        }
    }
}

impl ClientTransport for SocketsRelayClient {
    fn connect(&mut self, host: HostAddress) -> Result<(), TransportError> {
        let HostAddress::Relay(remote) = host else {
            return Err(TransportError::UnsupportedAddress(host));
        };
        self.disconnect();

        let status = self.api.subscribe_status(self.event_capacity);
        let handle = self.api.connect(remote, self.virtual_port)?;
        tracing::info!("Connecting to relay host {remote}");
        self.status = Some(status);
        self.pending = Some((handle, remote));
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close("client leaving");
        } else if let Some((handle, _)) = self.pending {
            self.api.close(handle, "client leaving");
        }
        self.pending = None;
        self.status = None;
    }

    fn poll(&mut self, max_per_peer: usize, events: &mut Vec<TransportEvent>) {
        let Some((handle, remote)) = self.pending else {
            return;
        };
        let changes: Vec<_> = match &self.status {
            Some(rx) => rx.try_iter().filter(|c| c.conn == handle).collect(),
            None => return,
        };

        for change in changes {
            match change.state {
                ConnectionState::Connecting => {}
                ConnectionState::Connected => {
                    self.connection = Some(Arc::new(SocketsRelayConnection::new(
                        Arc::clone(&self.api),
                        handle,
                        remote,
                    )));
                    events.push(TransportEvent::HostReachable);
                }
                ConnectionState::ClosedByPeer | ConnectionState::ProblemDetected => {
                    self.api.close(handle, "closed");
                    if let Some(conn) = self.connection.take() {
                        conn.invalidate();
                    }
                    self.pending = None;
                    self.status = None;
                    events.push(TransportEvent::HostLost(change.reason));
                    return;
                }
            }
        }

        if let Some(conn) = &self.connection {
            for bytes in self.api.receive(conn.handle, max_per_peer) {
                events.push(TransportEvent::Message {
                    from: remote,
                    bytes,
                });
            }
        }
    }

    fn host_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection
            .as_ref()
            .filter(|c| c.is_valid())
            .map(|c| Arc::clone(c) as Arc<dyn Connection>)
    }

    fn local_identity(&self) -> PeerId {
        self.api.local_identity()
    }
}
