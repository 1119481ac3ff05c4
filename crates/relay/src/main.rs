mod pairing;
mod ratelimit;
mod ws;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use pairing::PairingRegistry;
use ratelimit::AcceptRateLimiter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Accept budget per source IP: ten upgrades per second.
const RATE_LIMIT_ACCEPTS: u32 = 10;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

pub struct AppState {
    pub pairing: PairingRegistry,
    pub limiter: AcceptRateLimiter,
}

fn parse_args() -> Result<SocketAddr> {
    let mut bind = "0.0.0.0:8080".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("p2prd-relay {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("p2prd-relay - signaling relay pairing hosts and operators");
                println!();
                println!("USAGE:");
                println!("    p2prd-relay [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --bind <ADDR>     Listen address [default: 0.0.0.0:8080]");
                println!("    -V, --version     Print version and exit");
                println!("    -h, --help        Print this help and exit");
                std::process::exit(0);
            }
            "--bind" => {
                i += 1;
                bind = args.get(i).context("Missing --bind value")?.clone();
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    bind.parse().context("Invalid bind address")
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = parse_args()?;
    let state = Arc::new(AppState {
        pairing: PairingRegistry::new(),
        limiter: AcceptRateLimiter::new(RATE_LIMIT_ACCEPTS, RATE_LIMIT_WINDOW),
    });

    let app = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Failure to bind is the relay's one fatal error.
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(%bind, "Relay listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("Relay shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("signal handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown requested");
}
