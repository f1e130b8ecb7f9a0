//! Single-slot memory of the last host, for resuming after a world reload.

use crate::peer::HostAddress;

/// What is needed to rejoin without asking the user again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedHost {
    pub lobby_id: String,
    pub host: HostAddress,
}

#[derive(Debug, Default)]
pub struct ReconnectCache {
    slot: Option<CachedHost>,
}

impl ReconnectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `host`, replacing any earlier entry.
    pub fn cache(&mut self, host: CachedHost) {
        tracing::debug!("Caching host {} for reconnect", host.host);
        self.slot = Some(host);
    }

    pub fn has_cached_connection(&self) -> bool {
        self.slot.is_some()
    }

    pub fn peek(&self) -> Option<&CachedHost> {
        self.slot.as_ref()
    }

    /// Empty the slot and return what it held.
    pub fn take(&mut self) -> Option<CachedHost> {
        self.slot.take()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}
