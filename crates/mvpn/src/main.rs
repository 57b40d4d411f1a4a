//! mvpn: VPN Connection Manager CLI
//!
//! Wires the core connection manager to its real collaborators (the
//! control plane client, the elevation gate, the wg-quick engine and a
//! file-backed session store) or, with `--demo`, to all-local stand-ins
//! that behave like the hosted backend.

mod cli;
mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mvpn_api::ApiClient;
use mvpn_core::{
    ConnectionManager, ConnectionState, FileSessionStore, PermissionGate, PrivateKey,
    ServerAssignmentClient, SessionStore, StaticAssignmentClient, StaticGate, StubEngine,
    TunnelEngine,
};

use cli::{Cli, Command};
use settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Servers => servers(&settings, cli.demo).await,
        Command::Connect { server_id } => connect(&settings, cli.demo, &server_id).await,
        Command::Disconnect => disconnect(&settings, cli.demo).await,
        Command::Status => status(&settings, cli.demo).await,
        Command::Keygen => keygen(),
    }
}

struct Collaborators {
    client: Arc<dyn ServerAssignmentClient>,
    gate: Arc<dyn PermissionGate>,
    engine: Arc<dyn TunnelEngine>,
    store: Arc<dyn SessionStore>,
}

fn wire(settings: &Settings, demo: bool) -> Result<Collaborators> {
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::default_location()?);

    if demo {
        // all local: canned catalog, granted gate, pretend tunnel with
        // delays in the ballpark of a real handshake
        return Ok(Collaborators {
            client: Arc::new(StaticAssignmentClient::demo()),
            gate: Arc::new(StaticGate::granted()),
            engine: Arc::new(
                StubEngine::new()
                    .with_start_delay(Duration::from_secs(2))
                    .with_stop_delay(Duration::from_secs(1)),
            ),
            store,
        });
    }

    #[cfg(unix)]
    {
        let mut api = ApiClient::new(&settings.api_url)?;
        if let Some(token) = &settings.token {
            api = api.with_token(token);
        }
        Ok(Collaborators {
            client: Arc::new(api),
            gate: Arc::new(mvpn_core::ElevationGate::new()),
            engine: Arc::new(mvpn_core::WgQuickEngine::new(&settings.interface)?),
            store,
        })
    }
    #[cfg(not(unix))]
    {
        let _ = settings;
        anyhow::bail!("tunnel control requires a unix host; use --demo elsewhere")
    }
}

async fn servers(settings: &Settings, demo: bool) -> Result<()> {
    let c = wire(settings, demo)?;
    let servers = c.client.list().await?;

    for server in &servers {
        let availability = if server.status.is_online() {
            "online"
        } else {
            "offline"
        };
        println!(
            "{:<14} {:<12} {:<16} {}",
            server.id, server.region, server.ip, availability
        );
    }
    Ok(())
}

async fn connect(settings: &Settings, demo: bool, server_id: &str) -> Result<()> {
    let c = wire(settings, demo)?;
    let engine = c.engine.clone();
    let manager = ConnectionManager::new(
        c.client,
        c.gate,
        c.engine,
        c.store,
        settings.manager_config(),
    );

    // mirror every status change to the terminal, and watch for the
    // session ending underneath us (tunnel drop)
    let (state_tx, mut state_rx) = tokio::sync::watch::channel(ConnectionState::Disconnected);
    let token = manager.subscribe(move |status| {
        match &status.current_server {
            Some(server) => println!("  {}: {}", status.state, server),
            None => println!("  {}", status.state),
        }
        let _ = state_tx.send(status.state);
    });

    manager.connect(server_id).await?;
    info!("Session established, press Ctrl-C to disconnect");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if *state_rx.borrow() == ConnectionState::Disconnected {
                    info!("Session ended");
                    manager.unsubscribe(token);
                    return Ok(());
                }
            }
        }
    }

    // counters are only readable while the tunnel is still up
    let data_used = engine.data_used().await;
    manager.disconnect().await?;
    manager.unsubscribe(token);
    report_usage(settings, demo, data_used).await;
    Ok(())
}

/// Engine-level teardown. Works from a fresh process, where no manager
/// holds the session: whatever tunnel exists goes down, and the
/// persisted session is forgotten.
async fn disconnect(settings: &Settings, demo: bool) -> Result<()> {
    let c = wire(settings, demo)?;
    let data_used = c.engine.data_used().await;
    c.engine.stop().await?;
    c.store.clear().await?;
    report_usage(settings, demo, data_used).await;
    info!("Tunnel is down");
    Ok(())
}

/// Tell the backend how much the session moved, when the engine could
/// measure it. Best-effort: the tunnel is already down, so failures are
/// logged rather than returned.
async fn report_usage(settings: &Settings, demo: bool, data_used: Option<u64>) {
    if demo {
        return;
    }
    let Some(bytes) = data_used else { return };

    let api = match ApiClient::new(&settings.api_url) {
        Ok(api) => match &settings.token {
            Some(token) => api.with_token(token),
            None => api,
        },
        Err(e) => {
            warn!("Usage report skipped: {}", e);
            return;
        }
    };
    match api.report_usage(bytes).await {
        Ok(()) => info!("Reported {} bytes of session usage", bytes),
        Err(e) => warn!("Usage report failed: {}", e),
    }
}

async fn status(settings: &Settings, demo: bool) -> Result<()> {
    let c = wire(settings, demo)?;

    match c.store.load().await? {
        Some(server) => println!("recorded session: {}", server),
        None => println!("no recorded session"),
    }

    if !demo {
        let api = ApiClient::new(&settings.api_url)?;
        let reachable = api.health().await;
        println!(
            "backend {}: {}",
            settings.api_url,
            if reachable { "reachable" } else { "unreachable" }
        );
    }
    Ok(())
}

fn keygen() -> Result<()> {
    let private = PrivateKey::generate();
    println!("private key: {}", private.to_base64());
    println!("public key:  {}", private.public_key().to_base64());
    Ok(())
}
