//! meshwayd — the meshway daemon.
//!
//! Single binary with two modes:
//!
//! - **control** — the coordinator: heartbeat server, assessment engine,
//!   last-mile scheduler, dynamic route publisher
//! - **forwarder** — a data-plane node: heartbeat agent, probe executor,
//!   access proxy, relay proxy
//!
//! # Usage
//!
//! ```text
//! meshwayd control --config /etc/meshway/meshway.toml
//! meshwayd forwarder --config /etc/meshway/meshway.toml --port 50051
//! ```

mod config;
mod control;
mod forwarder;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::MeshwayConfig;

#[derive(Parser)]
#[command(name = "meshwayd", about = "meshway overlay daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (heartbeat server, assessments, scheduler,
    /// route publisher).
    Control {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "meshway.toml")]
        config: PathBuf,
    },

    /// Run a forwarding node (agent loop, access proxy, relay proxy).
    Forwarder {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "meshway.toml")]
        config: PathBuf,

        /// Outer TCP listener port (probe target + config push ingress).
        #[arg(long, default_value = "50051")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,meshwayd=debug,meshway=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Control { config } => {
            let config = MeshwayConfig::from_file(&config)?;
            control::run_control(config).await
        }
        Command::Forwarder { config, port } => {
            let config = MeshwayConfig::from_file(&config)?;
            forwarder::run_forwarder(config, port).await
        }
    }
}
