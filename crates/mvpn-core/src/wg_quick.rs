//! wg-quick Backed Engine
//!
//! [`WgQuickEngine`] realizes [`TunnelEngine`] on top of the `wg-quick`
//! tool: it renders the parsed config back to disk with canonical key
//! names and 0600 permissions, shells out for up/down, and watches the
//! kernel interface so an out-of-band drop (rmmod, `ip link del`, a
//! crashed daemon) surfaces as a [`TunnelEvent::Down`]. Session transfer
//! counters come from `wg show`.
//!
//! Up/down require root and a WireGuard-capable kernel, so the tests
//! here cover rendering and validation only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::engine::{EVENT_CHANNEL_CAPACITY, EngineError, TunnelEngine, TunnelEvent};
use crate::keys::{PrivateKey, PublicKey};

const DEFAULT_CONFIG_DIR: &str = "/etc/wireguard";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Canonical spellings wg-quick expects, per section
const INTERFACE_KEYS: &[(&str, &str)] = &[
    ("privatekey", "PrivateKey"),
    ("address", "Address"),
    ("dns", "DNS"),
    ("mtu", "MTU"),
    ("listenport", "ListenPort"),
    ("table", "Table"),
    ("fwmark", "FwMark"),
    ("preup", "PreUp"),
    ("postup", "PostUp"),
    ("predown", "PreDown"),
    ("postdown", "PostDown"),
];
const PEER_KEYS: &[(&str, &str)] = &[
    ("publickey", "PublicKey"),
    ("presharedkey", "PresharedKey"),
    ("endpoint", "Endpoint"),
    ("allowedips", "AllowedIPs"),
    ("persistentkeepalive", "PersistentKeepalive"),
];

/// Tunnel engine that drives wg-quick
pub struct WgQuickEngine {
    interface: String,
    config_dir: PathBuf,
    poll_interval: Duration,
    events: broadcast::Sender<TunnelEvent>,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WgQuickEngine {
    /// Create an engine for the named interface. The name ends up in
    /// shell commands and a file path, so only alphanumerics, hyphens
    /// and underscores are accepted.
    pub fn new(interface: &str) -> Result<Self, EngineError> {
        if interface.is_empty()
            || !interface
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(EngineError::InvalidInterface(interface.to_string()));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            interface: interface.to_string(),
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            poll_interval: DEFAULT_POLL_INTERVAL,
            events,
            watch_handle: Mutex::new(None),
        })
    }

    /// Write configs under this directory instead of /etc/wireguard
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    /// How often the link watcher probes the interface
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Path of the rendered config file
    pub fn conf_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface))
    }

    /// Render the config in wg-quick's expected shape, checking the key
    /// material on the way. Known keys get their canonical spelling and
    /// a stable order; unknown keys pass through lowercased.
    fn render(&self, config: &TunnelConfig) -> Result<String, EngineError> {
        let interface = config
            .interface()
            .ok_or_else(|| EngineError::Rejected("missing [interface] section".into()))?;
        let peer = config
            .peer()
            .ok_or_else(|| EngineError::Rejected("missing [peer] section".into()))?;

        let private = interface
            .get("privatekey")
            .ok_or_else(|| EngineError::Rejected("missing interface private key".into()))?;
        PrivateKey::from_base64(private)
            .map_err(|e| EngineError::Rejected(format!("interface private key: {e}")))?;

        let public = peer
            .get("publickey")
            .ok_or_else(|| EngineError::Rejected("missing peer public key".into()))?;
        PublicKey::from_base64(public)
            .map_err(|e| EngineError::Rejected(format!("peer public key: {e}")))?;

        let mut out = String::new();
        render_section(&mut out, "Interface", interface, INTERFACE_KEYS);
        out.push('\n');
        render_section(&mut out, "Peer", peer, PEER_KEYS);
        Ok(out)
    }

    async fn is_up(&self) -> bool {
        let output = Command::new("ip")
            .args(["link", "show", &self.interface])
            .output()
            .await;
        match output {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    fn spawn_link_watch(&self) {
        let interface = self.interface.clone();
        let events = self.events.clone();
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let alive = match Command::new("ip")
                    .args(["link", "show", &interface])
                    .output()
                    .await
                {
                    Ok(output) => output.status.success(),
                    Err(e) => {
                        debug!("Link probe for {} failed: {}", interface, e);
                        break;
                    }
                };
                if !alive {
                    let _ = events.send(TunnelEvent::Down {
                        reason: format!("interface {} disappeared", interface),
                    });
                    break;
                }
            }
        });

        let mut slot = self
            .watch_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    fn abort_link_watch(&self) {
        let handle = self
            .watch_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

fn render_section(
    out: &mut String,
    header: &str,
    values: &HashMap<String, String>,
    canonical: &[(&str, &str)],
) {
    out.push_str(&format!("[{}]\n", header));
    for (lower, spelled) in canonical {
        if let Some(value) = values.get(*lower) {
            out.push_str(&format!("{} = {}\n", spelled, value));
        }
    }
    let mut extras: Vec<_> = values
        .iter()
        .filter(|(key, _)| !canonical.iter().any(|(lower, _)| *lower == key.as_str()))
        .collect();
    extras.sort();
    for (key, value) in extras {
        out.push_str(&format!("{} = {}\n", key, value));
    }
}

/// Sum both directions of `wg show <interface> transfer` output, one
/// tab-separated `peer rx tx` line per peer. Malformed lines are skipped.
fn parse_transfer(raw: &str) -> u64 {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split('\t').skip(1);
            let rx: u64 = fields.next()?.parse().ok()?;
            let tx: u64 = fields.next()?.parse().ok()?;
            Some(rx + tx)
        })
        .sum()
}

#[async_trait]
impl TunnelEngine for WgQuickEngine {
    async fn start(&self, config: &TunnelConfig) -> Result<(), EngineError> {
        if self.is_up().await {
            return Err(EngineError::AlreadyActive);
        }

        let contents = self.render(config)?;
        let path = self.conf_path();

        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| EngineError::Io(e.to_string()))?;
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| EngineError::Io(e.to_string()))?;
        // conf holds the private key
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| EngineError::Io(e.to_string()))?;
        }

        info!("Bringing up tunnel interface {}", self.interface);
        // the caller may drop this future on a timeout; the child must
        // not keep running and bring the interface up behind our back
        let output = Command::new("wg-quick")
            .args(["up", path_str(&path)])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::Io(format!("failed to execute wg-quick: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let _ = tokio::fs::remove_file(&path).await;
            return Err(EngineError::CommandFailed {
                cmd: "wg-quick up".to_string(),
                stderr,
            });
        }

        self.spawn_link_watch();
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        // planned teardown, not a drop: silence the watcher first
        self.abort_link_watch();

        let path = self.conf_path();
        if !self.is_up().await {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(());
        }

        info!("Bringing down tunnel interface {}", self.interface);
        let output = Command::new("wg-quick")
            .args(["down", path_str(&path)])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::Io(format!("failed to execute wg-quick: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // already-down interfaces show up as this
            if !stderr.contains("is not a WireGuard interface") {
                return Err(EngineError::CommandFailed {
                    cmd: "wg-quick down".to_string(),
                    stderr,
                });
            }
            warn!("wg-quick down on inactive interface: {}", stderr);
        }

        let _ = tokio::fs::remove_file(&path).await;
        Ok(())
    }

    async fn data_used(&self) -> Option<u64> {
        let output = Command::new("wg")
            .args(["show", &self.interface, "transfer"])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(parse_transfer(&String::from_utf8_lossy(&output.stdout)))
    }

    fn events(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "\
[Interface]
PrivateKey = zrA2aBgnWCgvsUYYKNxaNZrsgX5/E2s4xPsY/S42IQo=
Address = 10.8.0.2/24
DNS = 1.1.1.1

[Peer]
PublicKey = Jqve1PXqIo4e+NjUvV9IT9Cz4mM9pUhALR7qLhf2taI=
Endpoint = 5.6.7.8:51820
AllowedIPs = 0.0.0.0/0
";

    #[test]
    fn test_interface_name_validation() {
        assert!(WgQuickEngine::new("wg0").is_ok());
        assert!(WgQuickEngine::new("mvpn0").is_ok());
        assert!(WgQuickEngine::new("my-vpn_1").is_ok());

        assert!(WgQuickEngine::new("").is_err());
        assert!(WgQuickEngine::new("wg0; rm -rf /").is_err());
        assert!(WgQuickEngine::new("wg0 && echo pwned").is_err());
        assert!(WgQuickEngine::new("../etc/shadow").is_err());
        assert!(WgQuickEngine::new("wg0\ntest").is_err());
    }

    #[test]
    fn test_conf_path_under_config_dir() {
        let engine = WgQuickEngine::new("mvpn0")
            .unwrap()
            .with_config_dir("/tmp/wg-test");
        assert_eq!(engine.conf_path(), PathBuf::from("/tmp/wg-test/mvpn0.conf"));
    }

    #[test]
    fn test_render_canonical_shape() {
        let engine = WgQuickEngine::new("wg0").unwrap();
        let config = TunnelConfig::parse(VALID);
        let rendered = engine.render(&config).unwrap();

        let interface_at = rendered.find("[Interface]").unwrap();
        let peer_at = rendered.find("[Peer]").unwrap();
        assert!(interface_at < peer_at);
        assert!(rendered.contains("PrivateKey = zrA2aBgnWCgvsUYYKNxaNZrsgX5/E2s4xPsY/S42IQo=\n"));
        assert!(rendered.contains("AllowedIPs = 0.0.0.0/0\n"));
    }

    #[test]
    fn test_render_restores_canonical_spelling() {
        let engine = WgQuickEngine::new("wg0").unwrap();
        let config = TunnelConfig::parse(
            "[INTERFACE]\npRiVaTeKeY = zrA2aBgnWCgvsUYYKNxaNZrsgX5/E2s4xPsY/S42IQo=\n\
             [PEER]\nPUBLICKEY = Jqve1PXqIo4e+NjUvV9IT9Cz4mM9pUhALR7qLhf2taI=\nallowedips = 0.0.0.0/0\n",
        );
        let rendered = engine.render(&config).unwrap();
        assert!(rendered.contains("[Interface]\nPrivateKey = "));
        assert!(rendered.contains("PublicKey = "));
        assert!(rendered.contains("AllowedIPs = 0.0.0.0/0\n"));
    }

    #[test]
    fn test_render_preserves_unknown_keys() {
        let raw = format!("{}SomeFutureKey = 42\n", VALID);
        let engine = WgQuickEngine::new("wg0").unwrap();
        let rendered = engine.render(&TunnelConfig::parse(&raw)).unwrap();
        assert!(rendered.contains("somefuturekey = 42\n"));
    }

    #[test]
    fn test_render_rejects_bad_private_key() {
        let engine = WgQuickEngine::new("wg0").unwrap();
        let config = TunnelConfig::parse(
            "[interface]\nprivatekey = not-base64!!\n[peer]\npublickey = Jqve1PXqIo4e+NjUvV9IT9Cz4mM9pUhALR7qLhf2taI=\n",
        );
        let err = engine.render(&config).unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
    }

    #[test]
    fn test_render_rejects_missing_peer_key() {
        let engine = WgQuickEngine::new("wg0").unwrap();
        let config = TunnelConfig::parse(
            "[interface]\nprivatekey = zrA2aBgnWCgvsUYYKNxaNZrsgX5/E2s4xPsY/S42IQo=\n[peer]\nendpoint = 1.2.3.4:51820\n",
        );
        let err = engine.render(&config).unwrap_err();
        assert_eq!(err, EngineError::Rejected("missing peer public key".into()));
    }

    #[test]
    fn test_parse_transfer_sums_all_peers() {
        let raw = "Jqve1PXqIo4e+NjUvV9IT9Cz4mM9pUhALR7qLhf2taI=\t1024\t2048\n\
                   hw1T/ZR1LxypDb4HiOdAa2uYV1HNVTKVmCeVfLIcYmk=\t10\t5\n";
        assert_eq!(parse_transfer(raw), 3087);
    }

    #[test]
    fn test_parse_transfer_tolerates_garbage() {
        assert_eq!(parse_transfer(""), 0);
        assert_eq!(parse_transfer("\n\n"), 0);
        assert_eq!(parse_transfer("peer\tnot-a-number\t5\n"), 0);
        assert_eq!(parse_transfer("short line\n"), 0);
    }

    // Actual up/down needs root and a WireGuard-capable kernel; covered
    // by manual runs, not unit tests.
}
