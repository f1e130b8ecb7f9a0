//! Client and server roles: a transport half driven by its state machine.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use crate::connection::Connection;
use crate::peer::{HostAddress, PeerId};
use crate::state::{ClientState, ServerState, StateWatch, TransitionError};
use crate::transport::{ClientTransport, ServerTransport, TransportError, TransportEvent};

#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("client role is busy ({0:?})")]
    ClientBusy(ClientState),

    #[error("server role is busy ({0:?})")]
    ServerBusy(ServerState),

    #[error(transparent)]
    Client(#[from] TransitionError<ClientState>),

    #[error(transparent)]
    Server(#[from] TransitionError<ServerState>),
}

pub struct ClientRole {
    state: StateWatch<ClientState>,
    transport: Box<dyn ClientTransport>,
}

impl ClientRole {
    pub fn new(transport: Box<dyn ClientTransport>) -> Self {
        Self {
            state: StateWatch::default(),
            transport,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state() != ClientState::Disconnected
    }

    pub fn local_identity(&self) -> PeerId {
        self.transport.local_identity()
    }

    pub fn host_connection(&self) -> Option<Arc<dyn Connection>> {
        self.transport.host_connection()
    }

    /// `Disconnected -> Connecting`, then ask the transport to reach `host`.
    pub(crate) fn connect(&mut self, host: HostAddress) -> Result<(), RoleError> {
        let state = self.state();
        if state != ClientState::Disconnected {
            return Err(RoleError::ClientBusy(state));
        }
        self.state.set(ClientState::Connecting)?;
        if let Err(e) = self.transport.connect(host) {
            tracing::error!("Client failed to start connecting to {host}: {e}");
            self.fail();
            return Err(e.into());
        }
        Ok(())
    }

    /// A message from the host decoded. Returns true on the
    /// `Connecting -> Connected` edge.
    pub(crate) fn on_host_message(&mut self) -> bool {
        if self.state() != ClientState::Connecting {
            return false;
        }
        matches!(self.state.set(ClientState::Connected), Ok(true))
    }

    pub(crate) fn enter_game(&mut self) -> Result<bool, RoleError> {
        Ok(self.state.set(ClientState::InGame)?)
    }

    pub(crate) fn poll(&mut self, max_per_peer: usize, events: &mut Vec<TransportEvent>) {
        if self.is_active() {
            self.transport.poll(max_per_peer, events);
        }
    }

    /// Enter `Error`, tear the transport down, and settle in `Disconnected`.
    pub(crate) fn fail(&mut self) {
        self.state.force(ClientState::Error);
        self.transport.disconnect();
        self.state.force(ClientState::Disconnected);
        tracing::warn!("Client role failed, back to Disconnected");
    }

    pub(crate) fn disconnect(&mut self) {
        self.transport.disconnect();
        self.state.force(ClientState::Disconnected);
    }
}

pub struct ServerRole {
    state: StateWatch<ServerState>,
    transport: Box<dyn ServerTransport>,
}

impl ServerRole {
    pub fn new(transport: Box<dyn ServerTransport>) -> Self {
        Self {
            state: StateWatch::default(),
            transport,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.state() == ServerState::Started
    }

    pub fn local_identity(&self) -> PeerId {
        self.transport.local_identity()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.transport.connections()
    }

    pub fn connection(&self, peer: PeerId) -> Option<Arc<dyn Connection>> {
        self.transport.connection(peer)
    }

    /// Run `Stopped -> Preparing -> Starting -> Started`. A failure in either
    /// setup step passes through `Error` and leaves the role `Stopped`.
    pub(crate) fn start(&mut self) -> Result<(), RoleError> {
        let state = self.state();
        if state != ServerState::Stopped {
            return Err(RoleError::ServerBusy(state));
        }

        self.state.set(ServerState::Preparing)?;
        if let Err(e) = self.transport.prepare() {
            tracing::error!("Server setup failed: {e}");
            self.fail();
            return Err(e.into());
        }

        self.state.set(ServerState::Starting)?;
        if let Err(e) = self.transport.start() {
            tracing::error!("Server start failed: {e}");
            self.fail();
            return Err(e.into());
        }

        self.state.set(ServerState::Started)?;
        tracing::info!("Server started as {}", self.local_identity());
        Ok(())
    }

    pub(crate) fn poll(&mut self, max_per_peer: usize, events: &mut Vec<TransportEvent>) {
        if self.is_started() {
            self.transport.poll(max_per_peer, events);
        }
    }

    pub(crate) fn disconnect(&mut self, peer: PeerId) {
        self.transport.disconnect(peer);
    }

    /// Enter `Error`, stop the transport, and settle in `Stopped`.
    pub(crate) fn fail(&mut self) {
        self.state.force(ServerState::Error);
        self.transport.stop();
        self.state.force(ServerState::Stopped);
        tracing::warn!("Server role failed, back to Stopped");
    }

    pub(crate) fn stop(&mut self) {
        if self.state() == ServerState::Stopped {
            return;
        }
        self.transport.stop();
        self.state.force(ServerState::Stopped);
        tracing::info!("Server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport double that records calls and fails on request.
    #[derive(Default)]
    struct FakeServer {
        fail_prepare: bool,
        fail_start: bool,
        stopped: usize,
        polled: usize,
    }

    impl ServerTransport for FakeServer {
        fn prepare(&mut self) -> Result<(), TransportError> {
            if self.fail_prepare {
                return Err(TransportError::InvalidAddress("bad".into()));
            }
            Ok(())
        }

        fn start(&mut self) -> Result<(), TransportError> {
            if self.fail_start {
                return Err(TransportError::NotPrepared);
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.stopped += 1;
        }

        fn local_identity(&self) -> PeerId {
            PeerId(1)
        }

        fn poll(&mut self, _max: usize, _events: &mut Vec<TransportEvent>) {
            self.polled += 1;
        }

        fn connections(&self) -> Vec<Arc<dyn Connection>> {
            Vec::new()
        }

        fn disconnect(&mut self, _peer: PeerId) {}
    }

    struct FakeClient {
        refuse: bool,
    }

    impl ClientTransport for FakeClient {
        fn connect(&mut self, host: HostAddress) -> Result<(), TransportError> {
            if self.refuse {
                return Err(TransportError::UnsupportedAddress(host));
            }
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn poll(&mut self, _max: usize, _events: &mut Vec<TransportEvent>) {}

        fn host_connection(&self) -> Option<Arc<dyn Connection>> {
            None
        }

        fn local_identity(&self) -> PeerId {
            PeerId::UNASSIGNED
        }
    }

    fn host() -> HostAddress {
        HostAddress::Relay(PeerId(1))
    }

    #[test]
    fn test_server_start_walks_every_state() {
        let mut role = ServerRole::new(Box::new(FakeServer::default()));
        let mut rx = role.subscribe();
        role.start().unwrap();
        assert_eq!(role.state(), ServerState::Started);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ServerState::Started);
    }

    #[test]
    fn test_prepare_failure_aborts_startup() {
        let mut role = ServerRole::new(Box::new(FakeServer {
            fail_prepare: true,
            ..Default::default()
        }));
        assert!(matches!(role.start(), Err(RoleError::Transport(_))));
        assert_eq!(role.state(), ServerState::Stopped);
    }

    #[test]
    fn test_start_failure_aborts_startup() {
        let mut role = ServerRole::new(Box::new(FakeServer {
            fail_start: true,
            ..Default::default()
        }));
        assert!(role.start().is_err());
        assert!(!role.is_started());
    }

    #[test]
    fn test_server_is_inert_until_started() {
        let mut role = ServerRole::new(Box::new(FakeServer::default()));
        role.poll(8, &mut Vec::new());
        role.start().unwrap();
        assert!(matches!(role.start(), Err(RoleError::ServerBusy(ServerState::Started))));
        role.poll(8, &mut Vec::new());
        role.stop();
        role.poll(8, &mut Vec::new());
        assert_eq!(role.state(), ServerState::Stopped);
    }

    #[test]
    fn test_client_connected_only_on_first_message() {
        let mut role = ClientRole::new(Box::new(FakeClient { refuse: false }));
        role.connect(host()).unwrap();
        assert_eq!(role.state(), ClientState::Connecting);
        assert!(role.enter_game().is_err());

        assert!(role.on_host_message());
        assert!(!role.on_host_message());
        assert_eq!(role.state(), ClientState::Connected);
        assert!(role.enter_game().unwrap());
    }

    #[test]
    fn test_client_refused_connect_returns_to_idle() {
        let mut role = ClientRole::new(Box::new(FakeClient { refuse: true }));
        assert!(role.connect(host()).is_err());
        assert_eq!(role.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_failure_passes_through_error_and_settles_idle() {
        let mut role = ClientRole::new(Box::new(FakeClient { refuse: false }));
        role.connect(host()).unwrap();
        role.on_host_message();
        let mut rx = role.subscribe();
        rx.borrow_and_update();

        role.fail();
        assert_eq!(role.state(), ClientState::Disconnected);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ClientState::Disconnected);
        // Reusable straight away.
        role.connect(host()).unwrap();
        assert_eq!(role.state(), ClientState::Connecting);
    }

    #[test]
    fn test_server_failure_settles_stopped_and_can_restart() {
        let mut role = ServerRole::new(Box::new(FakeServer::default()));
        role.start().unwrap();
        role.fail();
        assert_eq!(role.state(), ServerState::Stopped);
        role.start().unwrap();
        assert!(role.is_started());
    }

    #[test]
    fn test_client_connect_while_busy() {
        let mut role = ClientRole::new(Box::new(FakeClient { refuse: false }));
        role.connect(host()).unwrap();
        assert!(matches!(
            role.connect(host()),
            Err(RoleError::ClientBusy(ClientState::Connecting))
        ));
    }
}
