//! Packet registry and dispatcher.
//!
//! The [`PacketRegistry`] maps a [`PacketTag`] to a type-erased decode
//! function. [`PacketRegistry::decode_and_dispatch`] reads the tag, decodes,
//! validates, and runs the packet's [`PacketHandler::execute`]. Every failure
//! is reported as a [`DispatchOutcome`] and a log line, never a panic.

use std::any::{TypeId, type_name};
use std::collections::HashMap;

use crate::connection::Delivery;
use crate::hooks::GameHooks;
use crate::identity::NetworkIdentities;
use crate::network::NetError;
use crate::packet::{Packet, PacketTag, TAG_LEN, decode_body, encode, peek_tag};
use crate::peer::PeerId;
use crate::platform::Platform;
use crate::session::Session;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// What a handler may see and touch while it runs.
pub struct HandlerContext<'a, G: GameHooks> {
    /// Peer the packet came from. On a client this is always the host.
    pub sender: PeerId,
    pub session: &'a Session,
    pub identities: &'a mut NetworkIdentities<G::Entity>,
    pub game: &'a mut G,
    platform: &'a Platform,
}

impl<'a, G: GameHooks> HandlerContext<'a, G> {
    pub fn new(
        sender: PeerId,
        session: &'a Session,
        identities: &'a mut NetworkIdentities<G::Entity>,
        game: &'a mut G,
        platform: &'a Platform,
    ) -> Self {
        Self {
            sender,
            session,
            identities,
            game,
            platform,
        }
    }

    pub fn is_host(&self) -> bool {
        self.session.is_host()
    }

    /// Send `packet` back to the sender.
    pub fn reply<P: Packet>(&self, packet: &P, delivery: Delivery) -> Result<(), NetError> {
        let conn = if self.session.is_host() {
            self.platform.connection(self.sender)
        } else {
            self.platform.host_connection()
        };
        let conn = conn.ok_or(NetError::UnknownPeer(self.sender))?;
        conn.send(&encode(packet)?, delivery)?;
        Ok(())
    }

    /// Relay `packet` to every connection except `exclude`.
    pub fn broadcast<P: Packet>(
        &self,
        packet: &P,
        exclude: Option<PeerId>,
        delivery: Delivery,
    ) -> Result<usize, NetError> {
        Ok(self.platform.send_to_all(&encode(packet)?, exclude, delivery))
    }
}

/// A packet type that knows how to apply itself.
///
/// `execute` consumes the packet and runs with exclusive access to the
/// context; it is never re-entered for another packet while running.
pub trait PacketHandler<G: GameHooks>: Packet {
    fn execute(self, ctx: &mut HandlerContext<'_, G>);
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Result of one [`PacketRegistry::decode_and_dispatch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Decoded, valid, and executed.
    Handled(PacketTag),
    /// Decoded but failed `is_valid`; dropped.
    Invalid(PacketTag),
    /// No decoder registered for the tag; dropped.
    UnknownTag(PacketTag),
    /// The body did not decode; dropped.
    Malformed(PacketTag),
    /// Shorter than a tag; dropped.
    MissingTag,
}

impl DispatchOutcome {
    pub fn is_handled(self) -> bool {
        matches!(self, Self::Handled(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("tag {0} is reserved for session control")]
    ReservedTag(PacketTag),

    #[error("tag {tag} is already registered to {existing}, cannot register {new}")]
    TagConflict {
        tag: PacketTag,
        existing: &'static str,
        new: &'static str,
    },
}

type DispatchFn<G> = fn(&[u8], &mut HandlerContext<'_, G>) -> DispatchOutcome;

/// A type-erased decoder plus handler for one packet type.
struct Registration<G: GameHooks> {
    type_id: TypeId,
    type_name: &'static str,
    dispatch: DispatchFn<G>,
}

fn dispatch_as<G, P>(body: &[u8], ctx: &mut HandlerContext<'_, G>) -> DispatchOutcome
where
    G: GameHooks,
    P: PacketHandler<G>,
{
    let packet: P = match decode_body(body) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!(
                "Malformed {} ({} bytes) from {}: {e}",
                type_name::<P>(),
                body.len(),
                ctx.sender
            );
            return DispatchOutcome::Malformed(P::TAG);
        }
    };
    if !packet.is_valid() {
        tracing::warn!("Dropping invalid {packet:?} from {}", ctx.sender);
        return DispatchOutcome::Invalid(P::TAG);
    }
    tracing::trace!("Dispatching {} from {}", type_name::<P>(), ctx.sender);
    packet.execute(ctx);
    DispatchOutcome::Handled(P::TAG)
}

/// Tag -> decoder table. Filled once at startup.
pub struct PacketRegistry<G: GameHooks> {
    entries: HashMap<PacketTag, Registration<G>>,
}

impl<G: GameHooks> Default for PacketRegistry<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: GameHooks> PacketRegistry<G> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register `P` under `P::TAG`. Registering the same type again is a no-op.
    pub fn register<P: PacketHandler<G>>(&mut self) -> Result<(), RegistryError> {
        if P::TAG.is_reserved() {
            return Err(RegistryError::ReservedTag(P::TAG));
        }
        if let Some(existing) = self.entries.get(&P::TAG) {
            if existing.type_id == TypeId::of::<P>() {
                return Ok(());
            }
            return Err(RegistryError::TagConflict {
                tag: P::TAG,
                existing: existing.type_name,
                new: type_name::<P>(),
            });
        }
        self.entries.insert(
            P::TAG,
            Registration {
                type_id: TypeId::of::<P>(),
                type_name: type_name::<P>(),
                dispatch: dispatch_as::<G, P>,
            },
        );
        tracing::debug!("Registered {} as {}", type_name::<P>(), P::TAG);
        Ok(())
    }

    pub fn is_registered(&self, tag: PacketTag) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode one inbound buffer and run its handler.
    pub fn decode_and_dispatch(
        &self,
        bytes: &[u8],
        ctx: &mut HandlerContext<'_, G>,
    ) -> DispatchOutcome {
        let tag = match peek_tag(bytes) {
            Ok(tag) => tag,
            Err(e) => {
                tracing::warn!("Dropping packet from {}: {e}", ctx.sender);
                return DispatchOutcome::MissingTag;
            }
        };
        match self.entries.get(&tag) {
            Some(entry) => (entry.dispatch)(&bytes[TAG_LEN..], ctx),
            None => {
                tracing::warn!("Dropping packet with unknown tag {tag} from {}", ctx.sender);
                DispatchOutcome::UnknownTag(tag)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NetId;
    use crate::relay::LoopbackFabric;
    use serde::{Deserialize, Serialize};
    use tether_config::RelayConfig;

    #[derive(Default)]
    struct World {
        moved: Vec<(u32, [i32; 2])>,
        missing: usize,
    }

    impl GameHooks for World {
        type Entity = u32;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct MoveEntity {
        handle: NetId,
        to: [i32; 2],
    }

    impl Packet for MoveEntity {
        const TAG: PacketTag = PacketTag(10);

        fn is_valid(&self) -> bool {
            self.to.iter().all(|c| c.abs() < 10_000)
        }
    }

    impl PacketHandler<World> for MoveEntity {
        fn execute(self, ctx: &mut HandlerContext<'_, World>) {
            match ctx.identities.try_get(self.handle) {
                Some(entity) => ctx.game.moved.push((entity, self.to)),
                None => ctx.game.missing += 1,
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Impostor {
        text: String,
    }

    impl Packet for Impostor {
        const TAG: PacketTag = PacketTag(10);
    }

    impl PacketHandler<World> for Impostor {
        fn execute(self, _ctx: &mut HandlerContext<'_, World>) {}
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Sneaky;

    impl Packet for Sneaky {
        const TAG: PacketTag = PacketTag(-40);
    }

    impl PacketHandler<World> for Sneaky {
        fn execute(self, _ctx: &mut HandlerContext<'_, World>) {}
    }

    struct Fixture {
        registry: PacketRegistry<World>,
        session: Session,
        identities: NetworkIdentities<u32>,
        world: World,
        platform: Platform,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = PacketRegistry::new();
            registry.register::<MoveEntity>().unwrap();
            let fabric = LoopbackFabric::new();
            Self {
                registry,
                session: Session::new(),
                identities: NetworkIdentities::new(),
                world: World::default(),
                platform: Platform::sockets_relay(
                    fabric.endpoint(PeerId(1), "me"),
                    &RelayConfig::default(),
                ),
            }
        }

        fn dispatch(&mut self, bytes: &[u8]) -> DispatchOutcome {
            let mut ctx = HandlerContext::new(
                PeerId(2),
                &self.session,
                &mut self.identities,
                &mut self.world,
                &self.platform,
            );
            self.registry.decode_and_dispatch(bytes, &mut ctx)
        }
    }

    #[test]
    fn test_dispatch_runs_handler_with_resolved_entity() {
        let mut fx = Fixture::new();
        let handle = fx.identities.register(77).unwrap();
        let bytes = encode(&MoveEntity { handle, to: [3, 4] }).unwrap();

        assert_eq!(fx.dispatch(&bytes), DispatchOutcome::Handled(PacketTag(10)));
        assert_eq!(fx.world.moved, vec![(77, [3, 4])]);
    }

    #[test]
    fn test_missing_handle_is_a_quiet_no_op() {
        let mut fx = Fixture::new();
        let bytes = encode(&MoveEntity {
            handle: NetId(5),
            to: [0, 0],
        })
        .unwrap();
        assert!(fx.dispatch(&bytes).is_handled());
        assert_eq!(fx.world.missing, 1);
    }

    #[test]
    fn test_invalid_packet_skips_handler() {
        let mut fx = Fixture::new();
        let handle = fx.identities.register(1).unwrap();
        let bytes = encode(&MoveEntity {
            handle,
            to: [50_000, 0],
        })
        .unwrap();
        assert_eq!(fx.dispatch(&bytes), DispatchOutcome::Invalid(PacketTag(10)));
        assert!(fx.world.moved.is_empty());
    }

    #[test]
    fn test_malformed_packet_leaves_dispatcher_usable() {
        let mut fx = Fixture::new();
        let mut truncated = 10i32.to_le_bytes().to_vec();
        truncated.push(0x80);
        assert_eq!(fx.dispatch(&truncated), DispatchOutcome::Malformed(PacketTag(10)));

        let handle = fx.identities.register(9).unwrap();
        let good = encode(&MoveEntity { handle, to: [1, 1] }).unwrap();
        assert!(fx.dispatch(&good).is_handled());
    }

    #[test]
    fn test_unknown_and_short_buffers_are_dropped() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.dispatch(&999i32.to_le_bytes()),
            DispatchOutcome::UnknownTag(PacketTag(999))
        );
        assert_eq!(fx.dispatch(&[1, 2]), DispatchOutcome::MissingTag);
    }

    #[test]
    fn test_registration_rules() {
        let mut registry = PacketRegistry::<World>::new();
        registry.register::<MoveEntity>().unwrap();
        registry.register::<MoveEntity>().unwrap();
        assert_eq!(registry.len(), 1);

        assert!(matches!(
            registry.register::<Impostor>(),
            Err(RegistryError::TagConflict { .. })
        ));
        assert_eq!(
            registry.register::<Sneaky>(),
            Err(RegistryError::ReservedTag(PacketTag(-40)))
        );
    }
}
