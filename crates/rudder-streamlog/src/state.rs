//! Connection state of the shipping client.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// State of the aggregator connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    Disconnected,
    /// A reconnect sequence is running.
    Reconnecting,
    /// Connected to an aggregator.
    Connected,
    /// The client was closed.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        })
    }
}

/// Atomic cell holding a [`ConnectionState`].
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    /// Creates a cell holding `state`.
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Loads the current state.
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Reconnecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }

    /// Stores `state` unless the client is already closed.
    pub fn store(&self, state: ConnectionState) {
        let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (current != ConnectionState::Closed as u8).then_some(state as u8)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        let state = AtomicConnectionState::new(ConnectionState::Disconnected);
        assert_eq!(state.load(), ConnectionState::Disconnected);

        state.store(ConnectionState::Reconnecting);
        assert_eq!(state.load(), ConnectionState::Reconnecting);
        state.store(ConnectionState::Connected);
        assert_eq!(state.load(), ConnectionState::Connected);
    }

    #[test]
    fn closed_is_final() {
        let state = AtomicConnectionState::new(ConnectionState::Connected);
        state.store(ConnectionState::Closed);
        state.store(ConnectionState::Connected);
        assert_eq!(state.load(), ConnectionState::Closed);
        assert_eq!(state.load().to_string(), "closed");
    }
}
