//! mvpn api - Control Plane Client
//!
//! HTTP client for the VPN control plane: server catalog, config
//! assignment, usage reporting, and health. Implements
//! [`mvpn_core::ServerAssignmentClient`], so a manager wired with an
//! [`ApiClient`] talks to the real backend while tests keep using the
//! in-memory client.

mod client;

pub use client::{ApiClient, ApiError};
