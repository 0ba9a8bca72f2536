//! meshlink CLI
//!
//! Runs one overlay node: creates the TUN device, listens for peers,
//! dials the seed peers from the config file, and routes packets until
//! Ctrl+C or SIGTERM.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use meshlink::{LocalNode, MeshConfig, MeshError, Node, TcpTransport, TunDevice};

/// meshlink - peer-to-peer encrypted overlay network
#[derive(Parser, Debug)]
#[command(name = "meshlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the node configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Address to bind the listener on (port comes from ListenPort)
    #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind: Ipv4Addr,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), MeshError> {
    tracing::info!("Loading configuration from: {}", args.config.display());
    let config = MeshConfig::from_file(&args.config)?;

    let device = TunDevice::create(config.interface.address, config.interface.mtu).await?;
    tracing::info!("Using TUN device {}", device.name());

    let local = LocalNode::from_config(&config.interface);
    let bind_addr = SocketAddr::from((args.bind, config.interface.listen_port));
    let seeds = config.peers.iter().map(|p| p.endpoint).collect();

    let node = Node::new(local, Arc::new(TcpTransport), Arc::new(device))
        .start(bind_addr, seeds)
        .await?;

    // Shut down even when the signal handler could not be installed
    let signalled = shutdown_signal().await;
    node.shutdown().await;
    signalled
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> Result<(), MeshError> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
    Ok(())
}
