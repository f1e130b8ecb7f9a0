//! Raw-socket client: one outbound stream to the host.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::peer::{HostAddress, PeerId};
use crate::transport::socket::{SocketConfig, configure_stream};
use crate::transport::tcp::{SocketEvent, TcpConnection};
use crate::transport::{ClientTransport, TransportError, TransportEvent};

/// Raw-socket [`ClientTransport`].
pub struct TcpClient {
    handle: Handle,
    socket_config: SocketConfig,
    connection: Option<Arc<TcpConnection>>,
    host_addr: Option<SocketAddr>,
    inbound_queue: usize,
    /// Replaced on every disconnect so an abandoned connect attempt can
    /// never deliver into the next session.
    events_tx: mpsc::Sender<SocketEvent>,
    events_rx: mpsc::Receiver<SocketEvent>,
}

impl TcpClient {
    pub fn new(handle: Handle, inbound_queue: usize) -> Self {
        let inbound_queue = inbound_queue.max(1);
        let (events_tx, events_rx) = mpsc::channel(inbound_queue);
        Self {
            handle,
            socket_config: SocketConfig::default(),
            connection: None,
            host_addr: None,
            inbound_queue,
            events_tx,
            events_rx,
        }
    }

    /// Host endpoint of the current or pending connection.
    pub fn host_addr(&self) -> Option<SocketAddr> {
        self.host_addr
    }

    async fn connect_task(
        handle: Handle,
        addr: SocketAddr,
        socket_config: SocketConfig,
        events: mpsc::Sender<SocketEvent>,
    ) {
        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(source) => {
                tracing::warn!("Connect to {addr} failed: {source}");
                let _ = events
                    .send(SocketEvent::ConnectFailed(TransportError::Connect {
                        addr,
                        source,
                    }))
                    .await;
                return;
            }
        };

        if let Err(e) = configure_stream(&stream, &socket_config) {
            tracing::debug!("Could not configure socket to {addr}: {e}");
        }

        let host = PeerId::from_endpoint(addr);
        if TcpConnection::open(&handle, stream, host, addr, events, |_| {})
            .await
            .is_some()
        {
            tracing::info!("Connected to host at {addr}");
        }
    }
}

impl ClientTransport for TcpClient {
    fn connect(&mut self, host: HostAddress) -> Result<(), TransportError> {
        let HostAddress::Socket(addr) = host else {
            return Err(TransportError::UnsupportedAddress(host));
        };

        self.disconnect();
        self.host_addr = Some(addr);

        tracing::info!("Connecting to {addr}");
        self.handle.spawn(Self::connect_task(
            self.handle.clone(),
            addr,
            self.socket_config.clone(),
            self.events_tx.clone(),
        ));
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close();
            tracing::info!("Disconnected from {}", conn.remote_addr());
        }
        self.host_addr = None;
        while let Ok(event) = self.events_rx.try_recv() {
            if let SocketEvent::Opened(conn) = event {
                conn.close();
            }
        }
        let (events_tx, events_rx) = mpsc::channel(self.inbound_queue);
        self.events_tx = events_tx;
        self.events_rx = events_rx;
    }

    fn poll(&mut self, max_per_peer: usize, events: &mut Vec<TransportEvent>) {
        let mut taken = 0;
        while taken < max_per_peer {
            let Ok(event) = self.events_rx.try_recv() else {
                break;
            };
            match event {
                SocketEvent::Opened(conn) => {
                    self.connection = Some(conn);
                    events.push(TransportEvent::HostReachable);
                }
                SocketEvent::Frame { from, bytes } => {
                    taken += 1;
                    events.push(TransportEvent::Message { from, bytes });
                }
                SocketEvent::Closed { reason, .. } => {
                    self.connection = None;
                    events.push(TransportEvent::HostLost(reason));
                }
                SocketEvent::ConnectFailed(e) => {
                    self.host_addr = None;
                    events.push(TransportEvent::Failed(e));
                }
            }
        }
    }

    fn host_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection
            .as_ref()
            .filter(|c| c.is_valid())
            .map(|c| Arc::clone(c) as Arc<dyn Connection>)
    }

    /// Raw sockets carry no client identity; the host assigns one.
    fn local_identity(&self) -> PeerId {
        PeerId::UNASSIGNED
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close();
        }
    }
}
