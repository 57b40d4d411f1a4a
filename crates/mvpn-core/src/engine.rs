//! Tunnel Engines
//!
//! [`TunnelEngine`] is the capability boundary between connection
//! orchestration and the thing that actually moves packets. An engine
//! takes a validated [`TunnelConfig`], brings the tunnel up or down, and
//! may report out-of-band drops (link loss, daemon restart) through an
//! event stream.
//!
//! [`StubEngine`] is the scriptable in-memory engine used by tests and
//! the demo; the wg-quick backed engine lives in [`crate::wg_quick`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::TunnelConfig;

/// Capacity of the out-of-band event channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Out-of-band tunnel events
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The tunnel dropped without a stop() call
    Down { reason: String },
}

/// Engine failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("a tunnel is already active")]
    AlreadyActive,

    #[error("invalid interface name: {0}")]
    InvalidInterface(String),

    #[error("config rejected: {0}")]
    Rejected(String),

    #[error("tunnel I/O error: {0}")]
    Io(String),

    #[error("{cmd} failed: {stderr}")]
    CommandFailed { cmd: String, stderr: String },

    #[error("tunnel operation timed out")]
    Timeout,
}

/// Packet-moving backend behind the connection manager
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Bring the tunnel up with this config
    async fn start(&self, config: &TunnelConfig) -> Result<(), EngineError>;

    /// Tear the tunnel down. Tolerates an already-down tunnel.
    async fn stop(&self) -> Result<(), EngineError>;

    /// Bytes moved through the tunnel since it came up, both directions
    /// summed. `None` when the engine has no counters, or the tunnel is
    /// not up to measure.
    async fn data_used(&self) -> Option<u64> {
        None
    }

    /// Subscribe to out-of-band events. Engines without event support
    /// return a receiver that never yields.
    fn events(&self) -> broadcast::Receiver<TunnelEvent> {
        broadcast::channel(1).1
    }
}

/// Scriptable in-memory engine for tests and the demo
pub struct StubEngine {
    start_delay: Duration,
    stop_delay: Duration,
    fail_start: Option<String>,
    fail_stop: Option<String>,
    usage: Option<u64>,
    active: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    last_config: Mutex<Option<TunnelConfig>>,
    events: broadcast::Sender<TunnelEvent>,
}

impl StubEngine {
    /// Instant, reliable engine
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            start_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            fail_start: None,
            fail_stop: None,
            usage: None,
            active: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            last_config: Mutex::new(None),
            events,
        }
    }

    /// Make start() take this long
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Make stop() take this long
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Make every start() fail with this reason
    pub fn failing_start(mut self, reason: &str) -> Self {
        self.fail_start = Some(reason.to_string());
        self
    }

    /// Make every stop() fail with this reason
    pub fn failing_stop(mut self, reason: &str) -> Self {
        self.fail_stop = Some(reason.to_string());
        self
    }

    /// Report this many bytes moved while the tunnel is up
    pub fn with_data_used(mut self, bytes: u64) -> Self {
        self.usage = Some(bytes);
        self
    }

    /// Drop the tunnel out-of-band and notify event subscribers
    pub fn revoke(&self, reason: &str) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.events.send(TunnelEvent::Down {
            reason: reason.to_string(),
        });
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Config handed to the most recent start()
    pub fn last_config(&self) -> Option<TunnelConfig> {
        self.last_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelEngine for StubEngine {
    async fn start(&self, config: &TunnelConfig) -> Result<(), EngineError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if let Some(reason) = &self.fail_start {
            return Err(EngineError::Rejected(reason.clone()));
        }
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyActive);
        }
        *self
            .last_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        if let Some(reason) = &self.fail_stop {
            return Err(EngineError::Io(reason.clone()));
        }
        // stopping an already-down tunnel is not an error
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn data_used(&self) -> Option<u64> {
        if self.is_active() {
            self.usage
        } else {
            None
        }
    }

    fn events(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> TunnelConfig {
        TunnelConfig::parse("[interface]\nprivatekey = x\n[peer]\npublickey = y\n")
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let engine = StubEngine::new();
        assert!(!engine.is_active());

        engine.start(&sample_config()).await.unwrap();
        assert!(engine.is_active());
        assert_eq!(engine.start_calls(), 1);
        assert!(engine.last_config().is_some());

        engine.stop().await.unwrap();
        assert!(!engine.is_active());
        assert_eq!(engine.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let engine = StubEngine::new();
        engine.start(&sample_config()).await.unwrap();

        let err = engine.start(&sample_config()).await.unwrap_err();
        assert_eq!(err, EngineError::AlreadyActive);
    }

    #[tokio::test]
    async fn test_stop_when_inactive_is_ok() {
        let engine = StubEngine::new();
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scripted_start_failure() {
        let engine = StubEngine::new().failing_start("no such device");
        let err = engine.start(&sample_config()).await.unwrap_err();

        assert_eq!(err, EngineError::Rejected("no such device".into()));
        assert!(!engine.is_active());
    }

    #[tokio::test]
    async fn test_data_used_reported_only_while_up() {
        let engine = StubEngine::new().with_data_used(4096);
        assert_eq!(engine.data_used().await, None);

        engine.start(&sample_config()).await.unwrap();
        assert_eq!(engine.data_used().await, Some(4096));

        engine.stop().await.unwrap();
        assert_eq!(engine.data_used().await, None);
    }

    #[tokio::test]
    async fn test_revoke_notifies_subscribers() {
        let engine = StubEngine::new();
        let mut events = engine.events();

        engine.start(&sample_config()).await.unwrap();
        engine.revoke("link lost");

        assert!(!engine.is_active());
        let TunnelEvent::Down { reason } = events.recv().await.unwrap();
        assert_eq!(reason, "link lost");
    }

    #[tokio::test]
    async fn test_default_events_receiver_is_closed() {
        struct Quiet;

        #[async_trait]
        impl TunnelEngine for Quiet {
            async fn start(&self, _config: &TunnelConfig) -> Result<(), EngineError> {
                Ok(())
            }
            async fn stop(&self) -> Result<(), EngineError> {
                Ok(())
            }
        }

        let mut events = Quiet.events();
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(Quiet.data_used().await, None);
    }
}
