//! Client and server lifecycle states, observable through a watch channel.

use std::fmt;

use tokio::sync::watch;

/// Lifecycle of the local client role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientState {
    /// Initial state, and where every teardown ends.
    #[default]
    Disconnected,
    /// Transport asked to reach the host; nothing decoded from it yet.
    Connecting,
    /// First valid message from the host has been decoded.
    Connected,
    /// Fully joined the simulated world.
    InGame,
    /// Unrecoverable failure. Transient: the role sets it, tears its
    /// transport down and settles in `Disconnected` within the same call, so
    /// a watcher normally only sees the idle state. Failures reach the user
    /// as a [`Notice`](crate::Notice).
    Error,
}

/// Lifecycle of the local server role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerState {
    #[default]
    Stopped,
    /// Transport-specific setup (listen sockets, subscriptions).
    Preparing,
    Starting,
    /// The only state in which the server pumps network events.
    Started,
    /// Transient, like [`ClientState::Error`]; the role settles in `Stopped`.
    Error,
}

/// A lifecycle enum with a fixed transition table.
pub trait Lifecycle: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    fn can_transition(self, to: Self) -> bool;
}

impl Lifecycle for ClientState {
    fn can_transition(self, to: Self) -> bool {
        use ClientState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, InGame)
                | (_, Error)
                | (_, Disconnected)
        )
    }
}

impl Lifecycle for ServerState {
    fn can_transition(self, to: Self) -> bool {
        use ServerState::*;
        matches!(
            (self, to),
            (Stopped, Preparing)
                | (Preparing, Starting)
                | (Starting, Started)
                | (_, Error)
                | (_, Stopped)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal state transition {from:?} -> {to:?}")]
pub struct TransitionError<S: fmt::Debug> {
    pub from: S,
    pub to: S,
}

/// Current state plus subscribers that are woken on every real change.
pub struct StateWatch<S: Lifecycle> {
    tx: watch::Sender<S>,
}

impl<S: Lifecycle + Default> Default for StateWatch<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: Lifecycle> StateWatch<S> {
    pub fn new(initial: S) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Move to `to`.
    ///
    /// Returns `Ok(false)` without notifying if already in `to`, and an error
    /// (leaving the state untouched) if the table forbids the move.
    pub fn set(&self, to: S) -> Result<bool, TransitionError<S>> {
        let mut outcome = Ok(false);
        self.tx.send_if_modified(|current| {
            if *current == to {
                return false;
            }
            if !current.can_transition(to) {
                outcome = Err(TransitionError { from: *current, to });
                return false;
            }
            tracing::debug!("State {:?} -> {:?}", *current, to);
            *current = to;
            outcome = Ok(true);
            true
        });
        outcome
    }

    /// Move to `to` without consulting the table. Only for teardown edges.
    /// Returns false, without notifying, if already there.
    pub fn force(&self, to: S) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == to {
                return false;
            }
            tracing::debug!("State {:?} -> {:?} (forced)", *current, to);
            *current = to;
            true
        })
    }

    pub fn current(&self) -> S {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }
}

impl<S: Lifecycle> fmt::Debug for StateWatch<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateWatch").field(&self.current()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_only_reaches_connecting() {
        let from = ClientState::Disconnected;
        assert!(from.can_transition(ClientState::Connecting));
        assert!(!from.can_transition(ClientState::Connected));
        assert!(!from.can_transition(ClientState::InGame));
    }

    #[test]
    fn test_in_game_requires_connected() {
        let watch = StateWatch::<ClientState>::default();
        watch.set(ClientState::Connecting).unwrap();
        assert!(watch.set(ClientState::InGame).is_err());
        assert_eq!(watch.current(), ClientState::Connecting);
        watch.set(ClientState::Connected).unwrap();
        assert_eq!(watch.set(ClientState::InGame), Ok(true));
    }

    #[test]
    fn test_same_state_does_not_notify() {
        let watch = StateWatch::<ClientState>::default();
        let mut rx = watch.subscribe();
        assert_eq!(watch.set(ClientState::Connecting), Ok(true));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert_eq!(watch.set(ClientState::Connecting), Ok(false));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_error_and_teardown_reachable_from_anywhere() {
        for state in [
            ClientState::Disconnected,
            ClientState::Connecting,
            ClientState::Connected,
            ClientState::InGame,
        ] {
            assert!(state.can_transition(ClientState::Error));
        }
        assert!(ClientState::Error.can_transition(ClientState::Disconnected));
        assert!(!ClientState::Error.can_transition(ClientState::Connected));
    }

    #[test]
    fn test_force_skips_table_but_not_dedup() {
        let watch = StateWatch::<ClientState>::default();
        let mut rx = watch.subscribe();
        assert!(watch.force(ClientState::Error));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert!(!watch.force(ClientState::Error));
        assert!(!rx.has_changed().unwrap());
        assert!(watch.force(ClientState::Disconnected));
        assert_eq!(watch.current(), ClientState::Disconnected);
    }

    #[test]
    fn test_server_startup_sequence() {
        let watch = StateWatch::<ServerState>::default();
        assert!(watch.set(ServerState::Started).is_err());
        for next in [
            ServerState::Preparing,
            ServerState::Starting,
            ServerState::Started,
        ] {
            assert_eq!(watch.set(next), Ok(true));
        }
        assert_eq!(watch.set(ServerState::Stopped), Ok(true));
    }

    #[test]
    fn test_preparing_can_fail_directly() {
        let watch = StateWatch::<ServerState>::default();
        watch.set(ServerState::Preparing).unwrap();
        assert_eq!(watch.set(ServerState::Error), Ok(true));
        assert!(watch.set(ServerState::Starting).is_err());
    }
}
