//! Connection Management
//!
//! Coordinates the state machine, permission gate, assignment backend,
//! tunnel engine, and session store into the single entry point UIs
//! talk to.
//!
//! # Lifecycle
//!
//! ```text
//!             connect()                      disconnect()
//! Disconnected ------> Connecting --> Connected ------> Disconnecting
//!      ^                  |  |                                |
//!      |   (permission /  |  | (assignment / tunnel failure)  |
//!      |    config fail)  |  v                                |
//!      +------------------+ Error                             |
//!      ^                                                      |
//!      +------------------------------------------------------+
//! ```
//!
//! Exactly one transition runs at a time: a second `connect` or a
//! competing `disconnect` fails fast with `AlreadyInProgress` instead
//! of queueing. The one exception is `disconnect` during an in-flight
//! `connect`, which records a cancellation the connect honors at its
//! next checkpoint.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(client, gate, engine, store, ManagerConfig::default());
//!
//! let token = manager.subscribe(|status| println!("now {}", status.state));
//! manager.connect("eu-west-1").await?;
//!
//! assert!(manager.status().is_connected);
//!
//! manager.disconnect().await?;
//! manager.unsubscribe(token);
//! ```

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::assign::{AssignmentError, ServerAssignmentClient};
use crate::broadcast::{StatusBroadcaster, SubscriptionId};
use crate::config::{ConfigError, TunnelConfig};
use crate::engine::{EngineError, TunnelEngine, TunnelEvent};
use crate::model::{ConnectionSession, ConnectionState, ServerDescriptor, StatusSnapshot};
use crate::permission::PermissionGate;
use crate::state::{ConnectionStateMachine, InvalidTransition};
use crate::store::SessionStore;

/// Per-step time limits for connect/disconnect
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a permission prompt may sit unanswered
    pub permission_timeout: Duration,
    /// Limit for catalog and assignment calls to the backend
    pub assign_timeout: Duration,
    /// Limit for bringing the tunnel up
    pub start_timeout: Duration,
    /// Limit for tearing the tunnel down
    pub stop_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            permission_timeout: Duration::from_secs(60),
            assign_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("another transition is already in progress")]
    AlreadyInProgress,

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("permission to manage tunnels was denied")]
    PermissionDenied,

    #[error("connect cancelled by a disconnect request")]
    Cancelled,

    #[error("server assignment failed: {0}")]
    AssignmentFailed(#[from] AssignmentError),

    #[error("unusable tunnel config: {0}")]
    ConfigParse(#[from] ConfigError),

    #[error("tunnel start failed: {0}")]
    TunnelStartFailed(#[source] EngineError),

    #[error("tunnel stop failed: {0}")]
    TunnelStopFailed(#[source] EngineError),
}

/// Mutable lifecycle state, always updated as one unit
#[derive(Default)]
struct Inner {
    machine: ConnectionStateMachine,
    server: Option<ServerDescriptor>,
    session: Option<ConnectionSession>,
    cancel_requested: bool,
}

impl Inner {
    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::new(self.machine.state(), self.server.clone())
    }
}

/// Outcome of a state commit that a pending cancellation pre-empts
enum CommitOutcome {
    Committed(StatusSnapshot),
    /// A disconnect arrived after the last checkpoint; roll back
    CancelPending,
}

struct Shared {
    client: Arc<dyn ServerAssignmentClient>,
    gate: Arc<dyn PermissionGate>,
    engine: Arc<dyn TunnelEngine>,
    store: Arc<dyn SessionStore>,
    config: ManagerConfig,
    inner: RwLock<Inner>,
    /// Held for the whole of a connect or disconnect; `try_lock` failure
    /// is how a competing transition gets its fail-fast answer
    busy: AsyncMutex<()>,
    broadcaster: StatusBroadcaster,
}

impl Shared {
    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        self.read_inner().machine.state()
    }

    /// Read and clear the cancellation flag
    fn take_cancel(&self) -> bool {
        let mut inner = self.write_inner();
        std::mem::take(&mut inner.cancel_requested)
    }

    fn commit_connecting(
        &self,
        server: ServerDescriptor,
    ) -> Result<StatusSnapshot, InvalidTransition> {
        let mut inner = self.write_inner();
        inner.machine.request_transition(ConnectionState::Connecting)?;
        inner.server = Some(server);
        inner.session = None;
        Ok(inner.snapshot())
    }

    fn begin_session(&self, config: TunnelConfig) {
        let mut inner = self.write_inner();
        if let Some(server) = inner.server.clone() {
            inner.session = Some(ConnectionSession::new(server, config));
        }
    }

    /// Commit Connected, unless a cancellation slipped in after the last
    /// checkpoint. Checking the flag and transitioning under one lock
    /// leaves the race no window.
    fn commit_connected(&self) -> Result<CommitOutcome, InvalidTransition> {
        let mut inner = self.write_inner();
        if inner.cancel_requested {
            return Ok(CommitOutcome::CancelPending);
        }
        inner.machine.request_transition(ConnectionState::Connected)?;
        Ok(CommitOutcome::Committed(inner.snapshot()))
    }

    fn commit_disconnecting(&self) -> Result<StatusSnapshot, InvalidTransition> {
        let mut inner = self.write_inner();
        inner
            .machine
            .request_transition(ConnectionState::Disconnecting)?;
        Ok(inner.snapshot())
    }

    fn commit_disconnected(&self) -> Result<StatusSnapshot, InvalidTransition> {
        let mut inner = self.write_inner();
        inner
            .machine
            .request_transition(ConnectionState::Disconnected)?;
        inner.server = None;
        inner.session = None;
        inner.cancel_requested = false;
        Ok(inner.snapshot())
    }

    /// Park in Error, unless a cancellation arrived since the last
    /// checkpoint. Same single-lock rule as [`Self::commit_connected`].
    fn commit_error(&self) -> Result<CommitOutcome, InvalidTransition> {
        let mut inner = self.write_inner();
        if inner.cancel_requested {
            return Ok(CommitOutcome::CancelPending);
        }
        inner.machine.request_transition(ConnectionState::Error)?;
        inner.server = None;
        inner.session = None;
        Ok(CommitOutcome::Committed(inner.snapshot()))
    }

    /// Stop the tunnel, logging instead of failing: teardown always
    /// finishes even when the engine misbehaves.
    async fn stop_engine_best_effort(&self) {
        let err = match timeout(self.config.stop_timeout, self.engine.stop()).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => ConnectionError::TunnelStopFailed(e),
            Err(_) => ConnectionError::TunnelStopFailed(EngineError::Timeout),
        };
        warn!("Tunnel stop failed, continuing teardown: {}", err);
    }

    async fn run_connected_hook(&self, server: &ServerDescriptor) {
        if let Err(e) = self.store.persist(server).await {
            warn!("Failed to persist session for {}: {}", server.id, e);
        }
    }

    async fn run_disconnected_hook(&self) {
        if let Err(e) = self.store.clear().await {
            warn!("Failed to clear persisted session: {}", e);
        }
    }

    /// Commit Disconnected, clear the persisted session, notify
    async fn settle_disconnected(&self) -> Result<StatusSnapshot, InvalidTransition> {
        let snapshot = self.commit_disconnected()?;
        self.run_disconnected_hook().await;
        self.broadcaster.publish(&snapshot);
        Ok(snapshot)
    }

    /// Forced teardown after the engine reported the tunnel gone
    async fn handle_tunnel_down(&self, reason: &str) {
        warn!("Tunnel reported down: {}", reason);
        let _busy = self.busy.lock().await;

        if self.state() != ConnectionState::Connected {
            debug!("Tunnel drop ignored in state {}", self.state());
            return;
        }

        match self.commit_disconnecting() {
            Ok(snapshot) => self.broadcaster.publish(&snapshot),
            Err(e) => {
                warn!("Could not begin forced teardown: {}", e);
                return;
            }
        }
        self.stop_engine_best_effort().await;
        if let Err(e) = self.settle_disconnected().await {
            warn!("Could not finish forced teardown: {}", e);
        }
    }
}

/// Connection lifecycle orchestrator
///
/// Owns the single in-flight-transition rule: `connect` and
/// `disconnect` are the only ways state changes, every change goes
/// through the state machine, and every committed change is broadcast
/// to subscribers. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Wire up a manager from its collaborators.
    ///
    /// Must be called within a Tokio runtime: the engine's out-of-band
    /// event stream is watched from a background task that tears the
    /// session down if the tunnel drops underneath us.
    pub fn new(
        client: Arc<dyn ServerAssignmentClient>,
        gate: Arc<dyn PermissionGate>,
        engine: Arc<dyn TunnelEngine>,
        store: Arc<dyn SessionStore>,
        config: ManagerConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            client,
            gate,
            engine,
            store,
            config,
            inner: RwLock::new(Inner::default()),
            busy: AsyncMutex::new(()),
            broadcaster: StatusBroadcaster::new(),
        });
        Self::spawn_event_watcher(&shared);
        Self { shared }
    }

    /// Establish a connection to the named server.
    ///
    /// 1. Claim the single transition slot, or fail fast
    /// 2. Resolve the server against the catalog
    /// 3. Enter Connecting and notify
    /// 4. Ensure permission, prompting if needed
    /// 5. Obtain a tunnel config from the backend
    /// 6. Parse and validate it
    /// 7. Bring the tunnel up
    /// 8. Commit Connected, persist the session, notify
    ///
    /// A disconnect issued while this runs cancels it at the next
    /// checkpoint (after steps 4, 5, 6, or at the final commit).
    pub async fn connect(&self, server_id: &str) -> Result<(), ConnectionError> {
        let shared = &self.shared;

        // Step 1: one transition at a time
        let _busy = shared
            .busy
            .try_lock()
            .map_err(|_| ConnectionError::AlreadyInProgress)?;
        {
            let mut inner = shared.write_inner();
            if !inner.machine.can_transition(ConnectionState::Connecting) {
                debug!("Connect rejected in state {}", inner.machine.state());
                return Err(ConnectionError::AlreadyInProgress);
            }
            inner.cancel_requested = false;
        }

        // Step 2: resolve the requested server before touching state
        let server = self.resolve_server(server_id).await?;
        info!("Connecting to {}", server);

        // Step 3: enter Connecting with the chosen server
        let snapshot = shared.commit_connecting(server.clone())?;
        shared.broadcaster.publish(&snapshot);

        // Step 4: permission, prompting if not already held
        let mut granted = shared.gate.has_permission().await;
        if !granted {
            debug!("Tunnel permission not held, prompting");
            granted = match timeout(
                shared.config.permission_timeout,
                shared.gate.request_permission(),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "Permission prompt unanswered after {:?}",
                        shared.config.permission_timeout
                    );
                    false
                }
            };
        }
        if !granted {
            info!("Permission denied, abandoning connect to {}", server.id);
            shared.settle_disconnected().await?;
            return Err(ConnectionError::PermissionDenied);
        }
        if shared.take_cancel() {
            return Err(self.abort_cancelled(false).await);
        }

        // Step 5: ask the backend for a config
        let raw = match timeout(shared.config.assign_timeout, shared.client.assign(&server.id))
            .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                return Err(self.fail_connect(false, ConnectionError::AssignmentFailed(e)).await);
            }
            Err(_) => {
                let err = ConnectionError::AssignmentFailed(AssignmentError::Timeout);
                return Err(self.fail_connect(false, err).await);
            }
        };
        if shared.take_cancel() {
            return Err(self.abort_cancelled(false).await);
        }

        // Step 6: parse and validate. A bad config is the backend's
        // fault, not a local fault, so recover to Disconnected.
        let config = TunnelConfig::parse(&raw);
        if let Err(e) = config.validate() {
            warn!("Config for {} is unusable: {}", server.id, e);
            shared.settle_disconnected().await?;
            return Err(ConnectionError::ConfigParse(e));
        }
        if shared.take_cancel() {
            return Err(self.abort_cancelled(false).await);
        }

        // Step 7: bring the tunnel up. A start error means the engine is
        // down; a timeout leaves the outcome unknown, so its failure path
        // treats the engine as started.
        shared.begin_session(config.clone());
        match timeout(shared.config.start_timeout, shared.engine.start(&config)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(self.fail_connect(false, ConnectionError::TunnelStartFailed(e)).await);
            }
            Err(_) => {
                let err = ConnectionError::TunnelStartFailed(EngineError::Timeout);
                return Err(self.fail_connect(true, err).await);
            }
        }

        // Step 8: commit, unless a cancel slipped in during startup
        match shared.commit_connected()? {
            CommitOutcome::Committed(snapshot) => {
                shared.run_connected_hook(&server).await;
                shared.broadcaster.publish(&snapshot);
                info!("Connected to {}", server);
                Ok(())
            }
            CommitOutcome::CancelPending => Err(self.abort_cancelled(true).await),
        }
    }

    /// End the current session, or cancel an in-flight connect.
    ///
    /// Disconnecting while already disconnected is a no-op. Engine stop
    /// failures are logged and do not block teardown: the session ends
    /// regardless.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let shared = &self.shared;

        match shared.busy.try_lock() {
            Ok(_busy) => match shared.state() {
                ConnectionState::Disconnected => {
                    debug!("Disconnect requested while already disconnected");
                    Ok(())
                }
                ConnectionState::Error => {
                    // nothing is running; just settle the state
                    info!("Clearing error state");
                    shared.settle_disconnected().await?;
                    Ok(())
                }
                _ => self.teardown().await,
            },
            Err(_) => {
                // A transition holds the slot. A connect that has not yet
                // committed Connecting still shows Disconnected, so both
                // states record the cancellation for the connect's next
                // checkpoint. A flag recorded while a teardown is winding
                // down is reset by the next connect's step 1.
                let mut inner = shared.write_inner();
                match inner.machine.state() {
                    ConnectionState::Connecting | ConnectionState::Disconnected => {
                        inner.cancel_requested = true;
                        info!("Disconnect during connect, cancellation requested");
                        Ok(())
                    }
                    _ => Err(ConnectionError::AlreadyInProgress),
                }
            }
        }
    }

    /// Current status. Never blocks on in-flight transitions.
    pub fn status(&self) -> StatusSnapshot {
        self.shared.read_inner().snapshot()
    }

    /// The active session, while one exists
    pub fn current_session(&self) -> Option<ConnectionSession> {
        self.shared.read_inner().session.clone()
    }

    /// Register a status listener; see [`StatusBroadcaster::subscribe`]
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        self.shared.broadcaster.subscribe(listener)
    }

    /// Remove a status listener
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.broadcaster.unsubscribe(id)
    }

    /// Look the requested id up in the backend catalog
    async fn resolve_server(&self, server_id: &str) -> Result<ServerDescriptor, ConnectionError> {
        let servers = timeout(self.shared.config.assign_timeout, self.shared.client.list())
            .await
            .map_err(|_| ConnectionError::AssignmentFailed(AssignmentError::Timeout))??;
        servers
            .into_iter()
            .find(|s| s.id == server_id)
            .ok_or_else(|| AssignmentError::UnknownServer(server_id.to_string()).into())
    }

    /// Record a connect failure: log it, park the machine in Error,
    /// notify, and hand the error back for the caller to return.
    ///
    /// An already-accepted cancellation outranks the failure. The caller
    /// of `disconnect` was promised a teardown, so the machine settles in
    /// Disconnected instead of Error and the connect reports Cancelled.
    async fn fail_connect(&self, engine_started: bool, err: ConnectionError) -> ConnectionError {
        error!("Connect failed: {}", err);
        match self.shared.commit_error() {
            Ok(CommitOutcome::Committed(snapshot)) => {
                self.shared.broadcaster.publish(&snapshot);
                err
            }
            Ok(CommitOutcome::CancelPending) => self.abort_cancelled(engine_started).await,
            Err(e) => {
                warn!("Could not record error state: {}", e);
                err
            }
        }
    }

    /// Honor a cancellation observed mid-connect. Returns the error the
    /// cancelled connect hands back to its caller.
    async fn abort_cancelled(&self, engine_started: bool) -> ConnectionError {
        info!("Connect cancelled, rolling back");
        let snapshot = match self.shared.commit_disconnecting() {
            Ok(snapshot) => snapshot,
            Err(e) => return e.into(),
        };
        self.shared.broadcaster.publish(&snapshot);
        if engine_started {
            self.shared.stop_engine_best_effort().await;
        }
        if let Err(e) = self.shared.settle_disconnected().await {
            return e.into();
        }
        ConnectionError::Cancelled
    }

    /// Ordinary teardown of a live (or starting) tunnel
    async fn teardown(&self) -> Result<(), ConnectionError> {
        info!("Disconnecting");
        let snapshot = self.shared.commit_disconnecting()?;
        self.shared.broadcaster.publish(&snapshot);
        self.shared.stop_engine_best_effort().await;
        self.shared.settle_disconnected().await?;
        info!("Disconnected");
        Ok(())
    }

    /// Watch the engine's event stream for out-of-band drops. The task
    /// holds only a weak handle, so it dies with the last manager clone.
    fn spawn_event_watcher(shared: &Arc<Shared>) {
        let mut events = shared.engine.events();
        let weak = Arc::downgrade(shared);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TunnelEvent::Down { reason }) => {
                        let Some(shared) = weak.upgrade() else { break };
                        shared.handle_tunnel_down(&reason).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Tunnel event stream lagged, skipped {}", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}
