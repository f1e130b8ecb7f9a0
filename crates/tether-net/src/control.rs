//! Session control packets, carried on reserved tags alongside game traffic.

use serde::{Deserialize, Serialize};

use crate::packet::{Packet, PacketTag};
use crate::peer::{PeerId, PeerInfo};

/// Bumped whenever the control packets change shape.
pub const PROTOCOL_VERSION: u32 = 1;

pub const MAX_NAME_LEN: usize = tether_config::MAX_PLAYER_NAME_LEN;

/// Client to host, once the transport reports the host reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
    pub protocol_version: u32,
}

impl Packet for Hello {
    const TAG: PacketTag = PacketTag(-1);

    fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && self.name.chars().count() <= MAX_NAME_LEN
    }
}

/// Host to one client in reply to [`Hello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub host: PeerInfo,
    /// Identity the host knows this client by.
    pub you: PeerId,
    pub members: Vec<PeerInfo>,
}

impl Packet for Welcome {
    const TAG: PacketTag = PacketTag(-2);

    fn is_valid(&self) -> bool {
        self.you.is_assigned()
            && self.you != self.host.id
            && self.members.iter().any(|m| m.id == self.host.id)
    }
}

/// Host to everyone whenever membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub members: Vec<PeerInfo>,
}

impl Packet for Roster {
    const TAG: PacketTag = PacketTag(-3);

    fn is_valid(&self) -> bool {
        let mut ids: Vec<_> = self.members.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        ids.windows(2).all(|w| w[0] != w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{decode, encode, peek_tag};

    #[test]
    fn test_control_tags_are_reserved() {
        assert!(Hello::TAG.is_reserved());
        assert!(Welcome::TAG.is_reserved());
        assert!(Roster::TAG.is_reserved());
    }

    #[test]
    fn test_hello_rejects_blank_or_long_names() {
        let mut hello = Hello {
            name: "  ".into(),
            protocol_version: PROTOCOL_VERSION,
        };
        assert!(!hello.is_valid());
        hello.name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(!hello.is_valid());
        hello.name = "Ada".into();
        assert!(hello.is_valid());
    }

    #[test]
    fn test_welcome_must_list_host() {
        let host = PeerInfo::new(PeerId(1), "host");
        let welcome = Welcome {
            host: host.clone(),
            you: PeerId(2),
            members: vec![PeerInfo::new(PeerId(2), "guest")],
        };
        assert!(!welcome.is_valid());

        let welcome = Welcome {
            members: vec![host.clone(), PeerInfo::new(PeerId(2), "guest")],
            ..welcome
        };
        assert!(welcome.is_valid());
        let bytes = encode(&welcome).unwrap();
        assert_eq!(peek_tag(&bytes).unwrap(), Welcome::TAG);
        assert_eq!(decode::<Welcome>(&bytes).unwrap(), welcome);
    }

    #[test]
    fn test_roster_rejects_duplicates() {
        let roster = Roster {
            members: vec![PeerInfo::new(PeerId(1), "a"), PeerInfo::new(PeerId(1), "b")],
        };
        assert!(!roster.is_valid());
    }
}
