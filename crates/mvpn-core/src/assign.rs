//! Server Assignment
//!
//! The backend owns the server catalog and hands out per-connection
//! tunnel configs. [`ServerAssignmentClient`] is the seam: the real
//! implementation speaks HTTP to the control plane, while
//! [`StaticAssignmentClient`] serves a fixed catalog for demos and
//! tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::model::{ServerDescriptor, ServerStatus};

/// Assignment failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssignmentError {
    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("server {0} is offline")]
    ServerOffline(String),

    #[error("assignment request timed out")]
    Timeout,

    #[error("assignment backend error: {0}")]
    Backend(String),
}

/// Catalog listing and config assignment against the control plane
#[async_trait]
pub trait ServerAssignmentClient: Send + Sync {
    /// Fetch the current server catalog
    async fn list(&self) -> Result<Vec<ServerDescriptor>, AssignmentError>;

    /// Request a tunnel config for one server. Returns the raw config
    /// text; parsing and validation are the caller's job.
    async fn assign(&self, server_id: &str) -> Result<String, AssignmentError>;
}

/// In-memory assignment client with a fixed catalog
pub struct StaticAssignmentClient {
    servers: Vec<ServerDescriptor>,
    configs: HashMap<String, String>,
    fail_assign: Mutex<Option<String>>,
    list_delay: Duration,
    assign_delay: Duration,
    list_calls: AtomicUsize,
    assign_calls: AtomicUsize,
}

fn render_config(server: &ServerDescriptor) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = zrA2aBgnWCgvsUYYKNxaNZrsgX5/E2s4xPsY/S42IQo=\n\
         Address = 10.8.0.2/24\n\
         DNS = 1.1.1.1\n\
         \n\
         [Peer]\n\
         PublicKey = Jqve1PXqIo4e+NjUvV9IT9Cz4mM9pUhALR7qLhf2taI=\n\
         Endpoint = {}:51820\n\
         AllowedIPs = 0.0.0.0/0\n",
        server.ip
    )
}

impl StaticAssignmentClient {
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        Self {
            servers,
            configs: HashMap::new(),
            fail_assign: Mutex::new(None),
            list_delay: Duration::ZERO,
            assign_delay: Duration::ZERO,
            list_calls: AtomicUsize::new(0),
            assign_calls: AtomicUsize::new(0),
        }
    }

    /// Catalog matching the hosted demo backend
    pub fn demo() -> Self {
        Self::new(vec![
            ServerDescriptor::new("us-east-1", "US East", "1.2.3.4", ServerStatus::Online),
            ServerDescriptor::new("eu-west-1", "EU West", "5.6.7.8", ServerStatus::Online),
            ServerDescriptor::new("asia-south-1", "Asia South", "9.10.11.12", ServerStatus::Online),
        ])
    }

    /// Override the config text returned for one server
    pub fn with_config(mut self, server_id: &str, raw: &str) -> Self {
        self.configs.insert(server_id.to_string(), raw.to_string());
        self
    }

    /// Make every catalog fetch take this long before resolving
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    /// Make every assignment take this long before resolving
    pub fn with_assign_delay(mut self, delay: Duration) -> Self {
        self.assign_delay = delay;
        self
    }

    /// Force (`Some(message)`) or clear (`None`) assignment failure
    pub fn set_assign_failure(&self, message: Option<&str>) {
        *self.fail_assign.lock().unwrap_or_else(PoisonError::into_inner) =
            message.map(String::from);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn assign_calls(&self) -> usize {
        self.assign_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerAssignmentClient for StaticAssignmentClient {
    async fn list(&self) -> Result<Vec<ServerDescriptor>, AssignmentError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        Ok(self.servers.clone())
    }

    async fn assign(&self, server_id: &str) -> Result<String, AssignmentError> {
        self.assign_calls.fetch_add(1, Ordering::SeqCst);
        if !self.assign_delay.is_zero() {
            tokio::time::sleep(self.assign_delay).await;
        }

        let forced = self
            .fail_assign
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(message) = forced {
            return Err(AssignmentError::Backend(message));
        }

        let server = self
            .servers
            .iter()
            .find(|s| s.id == server_id)
            .ok_or_else(|| AssignmentError::UnknownServer(server_id.to_string()))?;
        if !server.status.is_online() {
            return Err(AssignmentError::ServerOffline(server_id.to_string()));
        }

        match self.configs.get(server_id) {
            Some(raw) => Ok(raw.clone()),
            None => Ok(render_config(server)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;

    #[tokio::test]
    async fn test_demo_catalog() {
        let client = StaticAssignmentClient::demo();
        let servers = client.list().await.unwrap();

        assert_eq!(servers.len(), 3);
        assert_eq!(servers[1].id, "eu-west-1");
        assert_eq!(servers[1].region, "EU West");
        assert!(servers.iter().all(|s| s.status.is_online()));
        assert_eq!(client.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_assigned_config_parses_valid() {
        let client = StaticAssignmentClient::demo();
        let raw = client.assign("eu-west-1").await.unwrap();

        let config = TunnelConfig::parse(&raw);
        config.validate().unwrap();
        assert_eq!(config.get("peer", "endpoint"), Some("5.6.7.8:51820"));
        assert_eq!(client.assign_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_server_rejected() {
        let client = StaticAssignmentClient::demo();
        let err = client.assign("mars-north-1").await.unwrap_err();
        assert_eq!(err, AssignmentError::UnknownServer("mars-north-1".into()));
    }

    #[tokio::test]
    async fn test_offline_server_rejected() {
        let client = StaticAssignmentClient::new(vec![ServerDescriptor::new(
            "us-east-1",
            "US East",
            "1.2.3.4",
            ServerStatus::Offline,
        )]);
        let err = client.assign("us-east-1").await.unwrap_err();
        assert_eq!(err, AssignmentError::ServerOffline("us-east-1".into()));
    }

    #[tokio::test]
    async fn test_forced_failure_toggles() {
        let client = StaticAssignmentClient::demo();
        client.set_assign_failure(Some("maintenance"));
        assert_eq!(
            client.assign("eu-west-1").await.unwrap_err(),
            AssignmentError::Backend("maintenance".into())
        );

        client.set_assign_failure(None);
        assert!(client.assign("eu-west-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_config_override() {
        let client = StaticAssignmentClient::demo().with_config("eu-west-1", "[interface]\n");
        let raw = client.assign("eu-west-1").await.unwrap();
        assert_eq!(raw, "[interface]\n");
    }
}
