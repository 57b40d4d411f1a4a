//! Core data model: connection states, server descriptors, and the
//! immutable snapshots handed to observers.

use crate::config::TunnelConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No tunnel, no session (initial state)
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Tunnel is up
    Connected,
    /// A teardown is in flight
    Disconnecting,
    /// The last connect attempt failed
    Error,
}

impl ConnectionState {
    /// Check if the tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// States during which a connection session (and its server) exists
    pub fn in_session(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Advertised availability of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Online,
    Offline,
}

impl ServerStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, ServerStatus::Online)
    }
}

/// A server as advertised by the assignment backend.
///
/// Immutable once received; the manager only ever clones it into
/// snapshots and the session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Backend identifier (e.g. "eu-west-1")
    pub id: String,
    /// Display region (e.g. "EU West")
    pub region: String,
    /// Server address
    pub ip: String,
    /// Advertised availability
    pub status: ServerStatus,
}

impl ServerDescriptor {
    pub fn new(id: &str, region: &str, ip: &str, status: ServerStatus) -> Self {
        Self {
            id: id.to_string(),
            region: region.to_string(),
            ip: ip.to_string(),
            status,
        }
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.region, self.id)
    }
}

/// An established (or establishing) connection.
///
/// Owned exclusively by the connection manager; at most one exists per
/// manager instance, and only read-only snapshots of its server ever
/// leave the manager.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub server: ServerDescriptor,
    pub config: TunnelConfig,
    pub started_at: SystemTime,
}

impl ConnectionSession {
    pub fn new(server: ServerDescriptor, config: TunnelConfig) -> Self {
        Self {
            server,
            config,
            started_at: SystemTime::now(),
        }
    }
}

/// The externally visible view of connection state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub is_connected: bool,
    pub state: ConnectionState,
    pub current_server: Option<ServerDescriptor>,
}

impl StatusSnapshot {
    /// Build a snapshot. `is_connected` is derived from the state so the
    /// two can never disagree.
    pub fn new(state: ConnectionState, current_server: Option<ServerDescriptor>) -> Self {
        Self {
            is_connected: state.is_connected(),
            state,
            current_server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());

        assert!(ConnectionState::Connecting.in_session());
        assert!(ConnectionState::Connected.in_session());
        assert!(ConnectionState::Disconnecting.in_session());
        assert!(!ConnectionState::Disconnected.in_session());
        assert!(!ConnectionState::Error.in_session());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }

    #[test]
    fn test_snapshot_derives_is_connected() {
        let server = ServerDescriptor::new("eu-west-1", "EU West", "5.6.7.8", ServerStatus::Online);

        let snapshot = StatusSnapshot::new(ConnectionState::Connected, Some(server.clone()));
        assert!(snapshot.is_connected);

        let snapshot = StatusSnapshot::new(ConnectionState::Connecting, Some(server));
        assert!(!snapshot.is_connected);
    }

    #[test]
    fn test_server_descriptor_serde() {
        let json = r#"{"id":"us-east-1","region":"US East","ip":"1.2.3.4","status":"online"}"#;
        let server: ServerDescriptor = serde_json::from_str(json).unwrap();

        assert_eq!(server.id, "us-east-1");
        assert_eq!(server.status, ServerStatus::Online);
        assert!(server.status.is_online());

        let back = serde_json::to_string(&server).unwrap();
        assert!(back.contains(r#""status":"online""#));
    }
}
