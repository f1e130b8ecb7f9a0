//! Cross-peer handles for simulation entities.
//!
//! Handles live in two disjoint ranges:
//!
//! - `[1, DYNAMIC_BASE)`: derived from an entity's content ([`IdentityKey`])
//!   so every peer computes the same value for map-authored entities.
//! - `[DYNAMIC_BASE, i32::MAX]`: allocated by a counter for entities created
//!   at runtime, then propagated by the host via [`NetworkIdentities::override_handle`].

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

/// First dynamically allocated handle.
pub const DYNAMIC_BASE: i32 = 1 << 30;

/// Integer handle naming one entity on every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetId(pub i32);

impl NetId {
    pub fn is_derived(self) -> bool {
        self.0 > 0 && self.0 < DYNAMIC_BASE
    }

    pub fn is_dynamic(self) -> bool {
        self.0 >= DYNAMIC_BASE
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// Another entity already owns the handle. Nothing was changed.
    #[error("handle {0} is already registered to another entity")]
    Collision(NetId),

    /// The entity already has a different handle.
    #[error("entity is already registered as {0}")]
    AlreadyRegistered(NetId),

    #[error("handle {0} is outside the valid range")]
    InvalidHandle(NetId),

    #[error("dynamic handle space exhausted")]
    Exhausted,
}

/// Deterministic content key for map-authored entities.
///
/// ```
/// use tether_net::IdentityKey;
///
/// let a = IdentityKey::new("door").cell([4, 0, -2]).attr(1u8).handle();
/// let b = IdentityKey::new("door").cell([4, 0, -2]).attr(1u8).handle();
/// assert_eq!(a, b);
/// assert!(a.is_derived());
/// ```
pub struct IdentityKey {
    hasher: FxHasher,
}

impl IdentityKey {
    pub fn new(kind: &str) -> Self {
        let mut hasher = FxHasher::default();
        kind.hash(&mut hasher);
        Self { hasher }
    }

    /// Grid cell the entity occupies.
    pub fn cell(mut self, cell: [i32; 3]) -> Self {
        for axis in cell {
            self.hasher.write_i32(axis);
        }
        self
    }

    /// Any additional distinguishing attribute (rotation, variant, owner).
    pub fn attr<T: Hash>(mut self, value: T) -> Self {
        value.hash(&mut self.hasher);
        self
    }

    /// Fold the key into the derived handle range.
    pub fn handle(&self) -> NetId {
        let span = (DYNAMIC_BASE - 1) as u64;
        NetId((self.hasher.finish() % span) as i32 + 1)
    }
}

/// Bidirectional entity <-> handle map for one session.
#[derive(Debug)]
pub struct NetworkIdentities<E> {
    by_handle: HashMap<NetId, E>,
    by_entity: HashMap<E, NetId>,
    next_dynamic: i32,
}

impl<E: Copy + Eq + Hash> Default for NetworkIdentities<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Copy + Eq + Hash> NetworkIdentities<E> {
    pub fn new() -> Self {
        Self {
            by_handle: HashMap::new(),
            by_entity: HashMap::new(),
            next_dynamic: DYNAMIC_BASE,
        }
    }

    /// Allocate a fresh dynamic handle, or return the entity's existing one.
    pub fn register(&mut self, entity: E) -> Result<NetId, IdentityError> {
        if let Some(&existing) = self.by_entity.get(&entity) {
            return Ok(existing);
        }
        let handle = self.allocate()?;
        self.insert(entity, handle);
        Ok(handle)
    }

    /// Register under the handle derived from `key`.
    ///
    /// A collision with another entity is rejected; the caller should treat
    /// the entity as unregistered.
    pub fn register_derived(&mut self, entity: E, key: &IdentityKey) -> Result<NetId, IdentityError> {
        let handle = key.handle();
        match (self.by_handle.get(&handle), self.by_entity.get(&entity)) {
            (Some(owner), _) if *owner == entity => Ok(handle),
            (Some(_), _) => {
                tracing::warn!("Identity collision on {handle}, registration rejected");
                Err(IdentityError::Collision(handle))
            }
            (None, Some(&existing)) => Err(IdentityError::AlreadyRegistered(existing)),
            (None, None) => {
                self.insert(entity, handle);
                Ok(handle)
            }
        }
    }

    /// Bind `entity` to a host-assigned `handle`, replacing its current one.
    pub fn override_handle(&mut self, entity: E, handle: NetId) -> Result<(), IdentityError> {
        if handle.0 <= 0 {
            return Err(IdentityError::InvalidHandle(handle));
        }
        match self.by_handle.get(&handle) {
            Some(owner) if *owner == entity => return Ok(()),
            Some(_) => return Err(IdentityError::Collision(handle)),
            None => {}
        }

        if let Some(previous) = self.by_entity.remove(&entity) {
            self.by_handle.remove(&previous);
        }
        if handle.is_dynamic() && handle.0 >= self.next_dynamic {
            self.next_dynamic = handle.0.saturating_add(1);
        }
        self.insert(entity, handle);
        Ok(())
    }

    /// Resolve a received handle. `None` is a normal outcome: the entity
    /// may not exist on this peer.
    pub fn try_get(&self, handle: NetId) -> Option<E> {
        self.by_handle.get(&handle).copied()
    }

    pub fn handle_of(&self, entity: E) -> Option<NetId> {
        self.by_entity.get(&entity).copied()
    }

    /// Forget an entity. Its dynamic handle is not handed out again.
    pub fn remove(&mut self, entity: E) -> Option<NetId> {
        let handle = self.by_entity.remove(&entity)?;
        self.by_handle.remove(&handle);
        Some(handle)
    }

    /// Drop every entry and restart allocation. Called at session end.
    pub fn clear(&mut self) {
        self.by_handle.clear();
        self.by_entity.clear();
        self.next_dynamic = DYNAMIC_BASE;
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    fn allocate(&mut self) -> Result<NetId, IdentityError> {
        while self.next_dynamic < i32::MAX {
            let candidate = NetId(self.next_dynamic);
            self.next_dynamic += 1;
            if !self.by_handle.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(IdentityError::Exhausted)
    }

    fn insert(&mut self, entity: E, handle: NetId) {
        self.by_handle.insert(handle, entity);
        self.by_entity.insert(entity, handle);
    }
}
