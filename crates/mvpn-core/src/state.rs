//! Connection State Machine
//!
//! The authoritative holder of the connection state. Every state change
//! in the crate goes through [`ConnectionStateMachine::request_transition`];
//! nothing else mutates the state, which makes the allowed-edge table the
//! single place where lifecycle legality is decided.
//!
//! # Allowed edges
//!
//! | From | To |
//! |------|----|
//! | Disconnected | Connecting |
//! | Error | Connecting, Disconnected |
//! | Connecting | Connected, Error, Disconnected, Disconnecting |
//! | Connected | Disconnecting |
//! | Disconnecting | Disconnected |
//!
//! `Error → Disconnected` exists so an explicit disconnect can recover the
//! error state; it skips `Disconnecting` because nothing is running in
//! `Error` and a `Disconnecting` snapshot always carries a server.

use crate::model::ConnectionState;

/// Rejected state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Guarded connection state
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    /// Create a machine in the initial `Disconnected` state
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check whether the edge `current → target` is in the table
    pub fn can_transition(&self, target: ConnectionState) -> bool {
        Self::allowed(self.state, target)
    }

    /// Move to `target` if the edge is allowed, otherwise reject without
    /// changing state. Returns the previous state on success.
    pub fn request_transition(
        &mut self,
        target: ConnectionState,
    ) -> Result<ConnectionState, InvalidTransition> {
        if !Self::allowed(self.state, target) {
            return Err(InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        let previous = self.state;
        self.state = target;
        Ok(previous)
    }

    fn allowed(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (from, to),
            (Disconnected, Connecting)
                | (Error, Connecting)
                | (Error, Disconnected)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
