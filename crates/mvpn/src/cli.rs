//! Command-line surface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mvpn", version, about = "VPN connection manager")]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Use the built-in demo catalog and a pretend tunnel instead of
    /// the real backend and wg-quick
    #[arg(long, global = true)]
    pub demo: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List available servers
    Servers,
    /// Connect to a server and hold the session until Ctrl-C
    Connect {
        /// Server id, e.g. eu-west-1
        server_id: String,
    },
    /// Tear down the tunnel and forget the session
    Disconnect,
    /// Show the recorded session and backend health
    Status,
    /// Generate a fresh tunnel key pair
    Keygen,
}
