//! mvpn core - VPN Connection Lifecycle
//!
//! Client-side connection management: a guarded state machine, a
//! permissive tunnel-config parser, and a manager that drives permission
//! checks, server assignment, and the tunnel engine while broadcasting
//! every committed state change.
//!
//! # Architecture
//!
//! ```text
//!                      ┌────────────────────┐
//!   subscribe/publish  │ ConnectionManager  │  persist/clear
//!  ┌──────────────────▶│                    │──────────────────┐
//!  │                   │  ┌──────────────┐  │                  │
//!  │  ┌─────────────┐  │  │ StateMachine │  │  ┌────────────┐  │
//!  └──│ Broadcaster │  │  └──────────────┘  │  │ SessionStore│◀─┘
//!     └─────────────┘  └──┬─────┬───────┬───┘  └────────────┘
//!                         │     │       │
//!          has/request    │     │       │  start/stop/events
//!        ┌────────────────┘     │       └────────────────┐
//!        ▼                      ▼                        ▼
//! ┌──────────────┐   ┌──────────────────┐   ┌─────────────────────┐
//! │PermissionGate│   │ AssignmentClient │   │    TunnelEngine     │
//! │ (elevation)  │   │  (control plane) │   │ (wg-quick or stub)  │
//! └──────────────┘   └──────────────────┘   └─────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **One session**: at most one tunnel session exists at any time
//! - **One transition**: concurrent connects/disconnects fail fast
//!   instead of queueing
//! - **Coherent status**: `is_connected` and `current_server` are
//!   derived from the state, never set independently
//! - **Ordered notifications**: listeners see every committed state
//!   change, in registration order

mod assign;
mod broadcast;
mod config;
mod engine;
mod keys;
mod manager;
mod model;
mod permission;
mod state;
mod store;
#[cfg(unix)]
mod wg_quick;

pub use assign::{AssignmentError, ServerAssignmentClient, StaticAssignmentClient};
pub use broadcast::{StatusBroadcaster, SubscriptionId};
pub use config::{ConfigError, INTERFACE_SECTION, PEER_SECTION, TunnelConfig};
pub use engine::{EngineError, StubEngine, TunnelEngine, TunnelEvent};
pub use keys::{KeyError, PrivateKey, PublicKey};
pub use manager::{ConnectionError, ConnectionManager, ManagerConfig};
pub use model::{
    ConnectionSession, ConnectionState, ServerDescriptor, ServerStatus, StatusSnapshot,
};
pub use permission::{PermissionGate, StaticGate};
#[cfg(unix)]
pub use permission::ElevationGate;
pub use state::{ConnectionStateMachine, InvalidTransition};
pub use store::{
    CURRENT_SERVER_KEY, FileSessionStore, MemorySessionStore, SessionStore, StoreError,
};
#[cfg(unix)]
pub use wg_quick::WgQuickEngine;
