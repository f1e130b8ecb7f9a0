//! One transport bound at process level: its lobby, client role and server role.

use std::sync::Arc;

use tether_config::{DirectConfig, PlatformKind, RelayConfig};
use tokio::runtime::Handle;

use crate::connection::{Connection, Delivery};
use crate::lobby::{DirectLobby, Lobby};
use crate::peer::PeerId;
use crate::relay::{
    LobbyService, PacketsRelayApi, PacketsRelayClient, PacketsRelayServer, RelayLobby,
    SocketsRelayApi, SocketsRelayClient, SocketsRelayServer,
};
use crate::role::{ClientRole, ServerRole};
use crate::transport::{TcpClient, TcpServer};

/// Everything one transport contributes.
///
/// Only one of the two roles is active at a time. Switching platforms means
/// dropping this one after a full teardown.
pub struct Platform {
    kind: PlatformKind,
    pub(crate) lobby: Box<dyn Lobby>,
    pub(crate) client: ClientRole,
    pub(crate) server: ServerRole,
}

impl Platform {
    pub fn new(
        kind: PlatformKind,
        lobby: Box<dyn Lobby>,
        client: ClientRole,
        server: ServerRole,
    ) -> Self {
        Self {
            kind,
            lobby,
            client,
            server,
        }
    }

    /// Raw TCP. Socket tasks run on `handle`.
    pub fn direct(config: &DirectConfig, handle: Handle) -> Self {
        let lobby = DirectLobby::new(config.advertise_address.clone(), config.port);
        let client = TcpClient::new(handle.clone(), config.inbound_queue);
        let server = TcpServer::new(config, handle);
        Self::new(
            PlatformKind::Direct,
            Box::new(lobby),
            ClientRole::new(Box::new(client)),
            ServerRole::new(Box::new(server)),
        )
    }

    /// Connection-handle relay; lobbies come from the same SDK.
    pub fn sockets_relay<A>(api: Arc<A>, config: &RelayConfig) -> Self
    where
        A: SocketsRelayApi + LobbyService + 'static,
    {
        let lobby = RelayLobby::new(api.clone(), config.event_queue_capacity);
        let client = SocketsRelayClient::new(api.clone(), config);
        let server = SocketsRelayServer::new(api, config);
        Self::new(
            PlatformKind::SocketsRelay,
            Box::new(lobby),
            ClientRole::new(Box::new(client)),
            ServerRole::new(Box::new(server)),
        )
    }

    /// Packet relay; lobbies come from the same SDK.
    pub fn packets_relay<A>(api: Arc<A>, config: &RelayConfig) -> Self
    where
        A: PacketsRelayApi + LobbyService + 'static,
    {
        let lobby = RelayLobby::new(api.clone(), config.event_queue_capacity);
        let client = PacketsRelayClient::new(api.clone(), config);
        let server = PacketsRelayServer::new(api, config);
        Self::new(
            PlatformKind::PacketsRelay,
            Box::new(lobby),
            ClientRole::new(Box::new(client)),
            ServerRole::new(Box::new(server)),
        )
    }

    pub fn kind(&self) -> PlatformKind {
        self.kind
    }

    pub fn lobby(&self) -> &dyn Lobby {
        self.lobby.as_ref()
    }

    pub fn client(&self) -> &ClientRole {
        &self.client
    }

    pub fn server(&self) -> &ServerRole {
        &self.server
    }

    /// Identity of the local peer on whichever role is active.
    pub fn local_identity(&self) -> PeerId {
        if self.server.is_started() {
            self.server.local_identity()
        } else {
            self.client.local_identity()
        }
    }

    /// Server side: every client. Client side: the host, once reachable.
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        if self.server.is_started() {
            self.server.connections()
        } else {
            self.client.host_connection().into_iter().collect()
        }
    }

    pub fn connection(&self, peer: PeerId) -> Option<Arc<dyn Connection>> {
        if self.server.is_started() {
            self.server.connection(peer)
        } else {
            self.client.host_connection().filter(|c| c.peer_id() == peer)
        }
    }

    pub fn host_connection(&self) -> Option<Arc<dyn Connection>> {
        self.client.host_connection()
    }

    /// Send `bytes` to every connection except `exclude`. A failed send is
    /// logged and skipped. Returns how many sends succeeded.
    pub fn send_to_all(&self, bytes: &[u8], exclude: Option<PeerId>, delivery: Delivery) -> usize {
        let mut sent = 0;
        for conn in self.connections() {
            if Some(conn.peer_id()) == exclude || !conn.is_valid() {
                continue;
            }
            match conn.send(bytes, delivery) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Send to {} failed: {e}", conn.debug_name()),
            }
        }
        sent
    }
}
