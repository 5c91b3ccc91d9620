//! Infinitoon - QUIC tunnels between edge hosts and a relay
//!
//! `infinitoon relay` listens for tunnel clients and answers their echo
//! heartbeats. `infinitoon tunnel` dials the configured relays and keeps the
//! connections alive.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use infinitoon_container::Container;
use infinitoon_transport_quic::QuicTransportFactory;
use infinitoon_tunnel::{EchoHandler, QuicClient, QuicServer, Tunnel, TunnelCommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Infinitoon - QUIC tunnels between edge hosts and a relay
#[derive(Parser, Debug)]
#[command(name = "infinitoon")]
#[command(version)]
#[command(long_version = concat!(
    env!("INFINITOON_GIT_TAG"),
    "\nCommit: ",
    env!("INFINITOON_GIT_HASH"),
    "\nBuilt: ",
    env!("INFINITOON_BUILD_TIME")
))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "INFINITOON_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept tunnel clients
    Relay {
        /// Listen address (host:port), overrides the configured server
        #[arg(long, env = "INFINITOON_LISTEN")]
        listen: Option<String>,
    },

    /// Connect the configured tunnel clients to their relay
    Tunnel {
        /// Relay address (host:port) used by every client
        #[arg(long, env = "INFINITOON_RELAY")]
        relay: Option<String>,
    },
}

/// `RUST_LOG` wins over the configured filter
fn setup_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn relay_tunnel(config: &AppConfig, listen: Option<&str>) -> Result<Tunnel> {
    let server_config = config.relay_server(listen)?;
    let transport = Arc::new(config.tls.server_transport()?);

    info!(
        server = %server_config.name,
        "Relay will listen on {}:{}",
        server_config.host,
        server_config.port
    );

    let name = server_config.name.clone();
    let server = QuicServer::new(
        QuicTransportFactory::new(),
        server_config,
        transport,
        Arc::new(EchoHandler),
    );

    let mut tunnel = Tunnel::new();
    tunnel.add_server(name, Arc::new(server));
    Ok(tunnel)
}

fn client_tunnel(config: &AppConfig, relay: Option<&str>) -> Result<Tunnel> {
    let factory = QuicTransportFactory::new();
    let transport = Arc::new(config.tls.client_transport());

    if config.tls.insecure {
        warn!("Certificate verification disabled (insecure mode)");
    }

    let mut tunnel = Tunnel::new();
    for client_config in config.tunnel_clients(relay)? {
        info!(
            client = %client_config.name,
            "Tunnel client will dial {}:{}",
            client_config.host,
            client_config.port
        );

        let name = client_config.name.clone();
        let client = QuicClient::new(&factory, client_config, transport.clone())
            .with_context(|| format!("Failed to create tunnel client {:?}", name))?
            .with_inbound_handler(Arc::new(EchoHandler));

        tunnel.add_client(name, Arc::new(client));
    }

    Ok(tunnel)
}

async fn run(command: Commands, config: AppConfig) -> Result<()> {
    let (name, tunnel) = match command {
        Commands::Relay { listen } => ("relay", relay_tunnel(&config, listen.as_deref())?),
        Commands::Tunnel { relay } => ("tunnel", client_tunnel(&config, relay.as_deref())?),
    };

    let mut container = Container::new();
    container.register_command(Arc::new(TunnelCommand::new(name, tunnel)));
    let container = Arc::new(container);
    let failed = container.cancellation_token();

    let run_task = tokio::spawn(
        {
            let container = container.clone();
            async move { container.run().await }
        }
        .in_current_span(),
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        },
        _ = failed.cancelled() => warn!("A command failed, shutting down..."),
    }

    let shutdown = container.shutdown().await;
    let run_result = run_task.await.context("Container task panicked")?;

    if let Err(e) = &shutdown {
        error!("Shutdown incomplete: {:#}", e);
    }
    run_result?;
    shutdown?;

    info!("Infinitoon stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    setup_logging(&config.log_filter(cli.verbose));

    let span = info_span!("app", app_name = %config.app_name, app_env = %config.app_env);
    run(cli.command, config).instrument(span).await
}
