//! burrowd: reverse tunnel server daemon

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use burrow_api::{build_router, ApiState};
use burrow_core::ServerConfig;
use burrow_proxy::{RequestDispatcher, TunnelServer};
use burrow_tunnel::{ClientRegistry, TunnelOptions};

/// Expose local HTTP services through pooled reverse tunnels.
#[derive(Debug, Parser)]
#[command(name = "burrowd", version, about)]
struct Args {
    /// Port for the public HTTP listener
    #[arg(long, default_value_t = 80)]
    port: u16,

    /// Address the public and per-client listeners bind to
    #[arg(long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Apex domain tunnels are served under (e.g. `tunnel.example.com`)
    #[arg(long)]
    domain: Option<String>,

    /// Advertise https:// urls in API responses
    #[arg(long)]
    secure: bool,

    /// Maximum pooled tunnel sockets per client
    #[arg(long = "max-sockets", default_value_t = burrow_core::DEFAULT_MAX_SOCKETS)]
    max_sockets: usize,
}

/// Pretty output for development, JSON once a supervisor is reading the
/// stream.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let production = std::env::var("BURROW_ENV").is_ok_and(|v| v == "production");
    if production {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        // The supervisor restarts us on a nonzero exit.
        error!(error = %e, "fatal server error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Arc::new(ServerConfig {
        address: args.address,
        port: args.port,
        domain: args.domain,
        secure: args.secure,
        max_sockets: args.max_sockets,
        ..ServerConfig::default()
    });

    let registry = ClientRegistry::new(TunnelOptions {
        bind_addr: config.address,
        max_sockets: config.max_sockets,
        idle_timeout: config.idle_timeout,
    });

    let app = build_router(ApiState {
        registry: Arc::clone(&registry),
        config: Arc::clone(&config),
    });
    let dispatcher = RequestDispatcher::new(registry, Arc::clone(&config), app);

    let addr = SocketAddr::new(config.address, config.port);
    let server = TunnelServer::bind(addr, dispatcher).await?;

    info!(
        addr = %server.local_addr()?,
        domain = config.domain.as_deref().unwrap_or("<any>"),
        max_sockets = config.max_sockets,
        secure = config.secure,
        "burrowd started"
    );

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await;

    Ok(())
}
