//! http-public CLI
//!
//! Forward HTTP traffic from the public Internet to localhost: run `server` on
//! a public host, `client` next to the service being exposed.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use http_public_client::{register, ClientConfig, ClusterEvent, TunnelCluster};
use http_public_server::{ServerConfig, TunnelServer};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

/// Forward HTTP traffic from the public Internet to localhost
#[derive(Parser, Debug)]
#[command(name = "http-public")]
#[command(about = "Forward HTTP traffic from the public Internet to localhost")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a local tunnel client
    #[command(alias = "c")]
    #[command(long_about = r#"
Register a subdomain with a tunnel server and forward every request it
receives for that subdomain to a local HTTP server.

EXAMPLES:
  # Expose localhost:3000 as https://myapp.tunnel.my.site
  http-public client https://tunnel.my.site --token $TOKEN --subdomain myapp

  # Expose a local HTTPS server with fewer connections
  http-public client https://tunnel.my.site https://localhost:8443 \
    --token $TOKEN --subdomain myapp --connections 4

ENVIRONMENT VARIABLES:
  HTTP_PUBLIC_TOKEN      Access token for the tunnel server
  HTTP_PUBLIC_SUBDOMAIN  Subdomain for the tunnel
    "#)]
    Client {
        /// Public server origin (e.g., https://tunnel.my.site)
        proxy: Url,

        /// Local server origin
        #[arg(default_value = "http://localhost:3000")]
        local: Url,

        /// Access token for the tunnel server
        #[arg(short, long, env = "HTTP_PUBLIC_TOKEN")]
        token: String,

        /// Subdomain for the tunnel
        #[arg(short = 'd', long, env = "HTTP_PUBLIC_SUBDOMAIN")]
        subdomain: String,

        /// Number of connections to open
        #[arg(short, long, default_value = "10")]
        connections: usize,

        /// Log requests arriving through the tunnel
        #[arg(short, long)]
        log: bool,

        /// Skip certificate verification for an https proxy (insecure, for development only)
        #[arg(long)]
        insecure: bool,
    },

    /// Start a public tunnel server
    #[command(alias = "s")]
    Server {
        /// Access token required for clients
        #[arg(short, long, env = "HTTP_PUBLIC_TOKEN")]
        token: String,

        /// Hostname of the server
        #[arg(short = 'H', long, default_value = "localhost")]
        host: String,

        /// IP address to listen on
        #[arg(short, long, default_value = "127.0.0.1")]
        address: IpAddr,

        /// Port number to listen on
        #[arg(short, long, default_value = "1111")]
        port: u16,

        /// Seconds an agent may go without tunnels before its hostname is released
        #[arg(long, default_value = "10")]
        idle_timeout: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = TunnelServer::bind(config.clone())
        .await
        .context("Failed to start tunnel server")?;
    info!(
        "http-public listening at {} for {}",
        server.local_addr()?,
        config.hostname
    );

    let handle = server.shutdown_handle();
    let server_task = tokio::spawn(server.run());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            handle.shutdown();
        }
        result = server_task => {
            return match result {
                Ok(res) => res.context("Tunnel server stopped"),
                Err(e) => {
                    error!("Server task panicked: {}", e);
                    Err(e.into())
                }
            };
        }
    }

    Ok(())
}

async fn run_client(config: ClientConfig) -> Result<()> {
    config.validate()?;
    if config.insecure {
        warn!("⚠️  Certificate verification disabled (insecure mode)");
    }

    let registration = register(&config)
        .await
        .with_context(|| format!("Failed to register with {}", config.proxy_url))?;

    let cluster = TunnelCluster::new(config, registration);
    let mut events = cluster.events();
    cluster.connect();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(ClusterEvent::Connected { public_url }) => {
                    info!("✅ http-public proxy listening at {}", public_url);
                }
                Ok(ClusterEvent::Error { message }) => {
                    error!("Tunnel error: {}", message);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} tunnel events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Server {
            token,
            host,
            address,
            port,
            idle_timeout,
        } => {
            run_server(ServerConfig {
                hostname: host,
                bind_addr: SocketAddr::new(address, port),
                token,
                idle_timeout: Duration::from_secs(idle_timeout),
            })
            .await
        }
        Commands::Client {
            proxy,
            local,
            token,
            subdomain,
            connections,
            log,
            insecure,
        } => {
            let mut config = ClientConfig::new(proxy, local, token, subdomain);
            config.connections = connections;
            config.log_requests = log;
            config.insecure = insecure;
            run_client(config).await
        }
    }
}
