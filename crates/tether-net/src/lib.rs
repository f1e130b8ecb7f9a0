//! Multiplayer session layer: packet codec and dispatch, transport-blind
//! connections over raw TCP or a relay SDK, lobby and session tracking,
//! cross-peer entity identities, and a reconnect cache.

pub mod connection;
pub mod control;
pub mod framing;
pub mod hooks;
pub mod identity;
pub mod lobby;
pub mod network;
pub mod packet;
pub mod peer;
pub mod platform;
pub mod reconnect;
pub mod registry;
pub mod relay;
pub mod role;
pub mod session;
pub mod state;
pub mod transport;

pub use connection::{Connection, Delivery, SendError};
pub use control::PROTOCOL_VERSION;
pub use framing::{FrameError, MAX_FRAME_LEN, read_frame, write_frame};
pub use hooks::{GameHooks, Notice};
pub use identity::{IdentityError, IdentityKey, NetId, NetworkIdentities};
pub use lobby::{DirectLobby, Lobby, LobbyError, LobbyEvent, LobbyOptions};
pub use network::{NetError, Network};
pub use packet::{CodecError, Packet, PacketTag, decode, encode, peek_tag};
pub use peer::{HostAddress, PeerId, PeerInfo};
pub use platform::Platform;
pub use reconnect::{CachedHost, ReconnectCache};
pub use registry::{DispatchOutcome, HandlerContext, PacketHandler, PacketRegistry, RegistryError};
pub use relay::{LoopbackEndpoint, LoopbackFabric, RelayError};
pub use role::{ClientRole, RoleError, ServerRole};
pub use session::{Peer, Session};
pub use state::{ClientState, ServerState, TransitionError};
pub use transport::{ClientTransport, ServerTransport, TransportError, TransportEvent};
