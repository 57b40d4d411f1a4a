//! Permission Gating
//!
//! Tunnel setup needs an OS-level capability (net admin, an approved
//! system extension, an accepted elevation prompt). The gate abstracts
//! over that: [`PermissionGate::has_permission`] re-queries the live
//! state on every call since the user can revoke it between connects,
//! and [`PermissionGate::request_permission`] suspends for as long as
//! the platform prompt takes. Callers that cannot wait forever bound
//! the request with their own timeout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(unix)]
use tracing::warn;

/// Capability check for establishing tunnels
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Whether the capability is currently held. Never cached.
    async fn has_permission(&self) -> bool;

    /// Prompt for the capability. Resolves with the outcome once the
    /// user (or platform) decides; imposes no timeout of its own.
    async fn request_permission(&self) -> bool;
}

/// Scriptable gate for tests and demo wiring
pub struct StaticGate {
    granted: AtomicBool,
    grant_on_request: bool,
    request_delay: Duration,
    request_calls: AtomicUsize,
}

impl StaticGate {
    /// Gate that already holds the capability
    pub fn granted() -> Self {
        Self {
            granted: AtomicBool::new(true),
            grant_on_request: false,
            request_delay: Duration::ZERO,
            request_calls: AtomicUsize::new(0),
        }
    }

    /// Gate that denies and keeps denying when prompted
    pub fn denied() -> Self {
        Self {
            granted: AtomicBool::new(false),
            grant_on_request: false,
            request_delay: Duration::ZERO,
            request_calls: AtomicUsize::new(0),
        }
    }

    /// Gate that denies until prompted, then grants
    pub fn denied_until_requested() -> Self {
        Self {
            grant_on_request: true,
            ..Self::denied()
        }
    }

    /// Make every prompt take this long before resolving
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Flip the held capability, e.g. to simulate revocation
    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }

    /// How many times the prompt was shown
    pub fn request_calls(&self) -> usize {
        self.request_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionGate for StaticGate {
    async fn has_permission(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    async fn request_permission(&self) -> bool {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
        if self.grant_on_request {
            self.granted.store(true, Ordering::SeqCst);
        }
        self.granted.load(Ordering::SeqCst)
    }
}

/// Gate backed by effective-uid elevation. Tunnel interfaces need root
/// to create, and there is no prompt to escalate a running process, so
/// requesting just reports the current state with a hint in the log.
#[cfg(unix)]
pub struct ElevationGate;

#[cfg(unix)]
impl ElevationGate {
    pub fn new() -> Self {
        Self
    }

    fn is_elevated(&self) -> bool {
        unsafe { libc::geteuid() == 0 }
    }
}

#[cfg(unix)]
impl Default for ElevationGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
#[async_trait]
impl PermissionGate for ElevationGate {
    async fn has_permission(&self) -> bool {
        self.is_elevated()
    }

    async fn request_permission(&self) -> bool {
        let elevated = self.is_elevated();
        if !elevated {
            warn!("Tunnel setup requires root; re-run with sudo");
        }
        elevated
    }
}
