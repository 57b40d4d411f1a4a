//! Session Persistence
//!
//! Remembers which server the client is connected to, so a restarted
//! process (or a UI attaching later) can recover the last session. The
//! manager writes the descriptor when a connection is established and
//! clears it when the session ends; everything goes through one fixed
//! key so readers and writers cannot drift apart.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::model::ServerDescriptor;

/// The single key under which the active server is stored
pub const CURRENT_SERVER_KEY: &str = "current-server";

/// Persistence failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("no state directory available for this platform")]
    NoStateDir,
}

/// Durable record of the active session's server
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Record this server as the active session
    async fn persist(&self, server: &ServerDescriptor) -> Result<(), StoreError>;

    /// The recorded server, if a session was active
    async fn load(&self) -> Result<Option<ServerDescriptor>, StoreError>;

    /// Forget the recorded server. Clearing an empty store is fine.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// JSON-file store under a state directory
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Platform state directory, e.g. `~/.local/state/mvpn` on Linux
    pub fn default_location() -> Result<Self, StoreError> {
        let base = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .ok_or(StoreError::NoStateDir)?;
        Ok(Self::new(base.join("mvpn")))
    }

    fn path(&self) -> PathBuf {
        self.dir.join(format!("{CURRENT_SERVER_KEY}.json"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn persist(&self, server: &ServerDescriptor) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(server)?;
        tokio::fs::write(self.path(), json).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<ServerDescriptor>, StoreError> {
        let bytes = match tokio::fs::read(self.path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests
#[derive(Default)]
pub struct MemorySessionStore {
    entry: Mutex<Option<ServerDescriptor>>,
    persist_calls: AtomicUsize,
    clear_calls: AtomicUsize,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }

    /// Synchronous peek for assertions
    pub fn current(&self) -> Option<ServerDescriptor> {
        self.entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn persist(&self, server: &ServerDescriptor) -> Result<(), StoreError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        *self.entry.lock().unwrap_or_else(PoisonError::into_inner) = Some(server.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<ServerDescriptor>, StoreError> {
        Ok(self.current())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        *self.entry.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
