mod capture;
mod config;
mod console;
mod desktop;
mod encoder;
mod input;
mod ipc;
mod lockout;
mod monitors;
mod password;
#[cfg(windows)]
mod platform;
mod resolver;
mod rtc;
mod session;
mod signaling;

use anyhow::{Context, Result};
use config::ConfigStore;
use session::SessionController;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Args {
    config_dir: PathBuf,
}

fn parse_args() -> Result<Args> {
    let mut config_dir = ConfigStore::default_dir();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("p2prd-host {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("p2prd-host - unattended remote desktop host");
                println!();
                println!("USAGE:");
                println!("    p2prd-host [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --config-dir <DIR>    Configuration directory");
                println!("                          [default: {}]", config_dir.display());
                println!("    -V, --version         Print version and exit");
                println!("    -h, --help            Print this help and exit");
                std::process::exit(0);
            }
            "--config-dir" => {
                i += 1;
                config_dir = PathBuf::from(args.get(i).context("Missing --config-dir value")?);
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args { config_dir })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let cancel = CancellationToken::new();

    // Startup failures here are the only fatal paths: an unusable config
    // directory or an unbindable IPC channel.
    let store = Arc::new(ConfigStore::open(&args.config_dir)?);
    let ipc = ipc::IpcServer::bind(Arc::clone(&store), cancel.clone())?;

    let config = store.snapshot();
    info!(host_id = %config.host_id, dir = %args.config_dir.display(), "Host starting");

    let desktop: Arc<dyn desktop::DesktopSwitcher> = Arc::from(desktop::platform_switcher());
    #[cfg(windows)]
    let monitor_source: Box<dyn monitors::MonitorSource> = Box::new(platform::WinMonitorSource);
    #[cfg(not(windows))]
    let monitor_source: Box<dyn monitors::MonitorSource> =
        Box::new(monitors::SyntheticMonitorSource);
    let registry = Arc::new(Mutex::new(monitors::MonitorRegistry::new(monitor_source)));

    let injector = Arc::new(input::InputInjector::new(
        input::platform_backend(),
        Arc::clone(&desktop),
    ));
    let pipeline = Arc::new(Mutex::new(capture::CapturePipeline::platform(
        Arc::clone(&desktop),
        Arc::clone(&registry),
    )));
    let adapter = Arc::new(Mutex::new(encoder::Vp8RtpAdapter::new(
        encoder::platform_encoder_factory(),
    )));

    let (signaling_tx, signaling_rx) = mpsc::channel(64);
    let signaling = Arc::new(signaling::SignalingClient::new(
        signaling_tx,
        cancel.clone(),
    ));
    let (rtc_tx, rtc_rx) = mpsc::channel(64);
    let rtc = Arc::new(rtc::WebRtcCore::new(rtc_tx));

    let reconnect = Arc::new(Notify::new());
    let controller = Arc::new(SessionController::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        injector,
        Arc::clone(&pipeline),
        adapter,
        Arc::clone(&rtc),
        Arc::clone(&signaling) as Arc<dyn session::ControlSink>,
        Arc::clone(&reconnect),
        cancel.clone(),
    ));

    tokio::spawn(ipc.run());

    let (watcher, mut console_rx) = console::ConsoleWatcher::new(cancel.clone());
    tokio::spawn(watcher.run());
    {
        // Console transitions invalidate desktop duplication; reset the
        // capture tiers so the next frame reinitializes on the new session.
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            while console_rx.changed().await.is_ok() {
                pipeline.lock().unwrap_or_else(|e| e.into_inner()).reset();
            }
        });
    }

    let resolver = resolver::ResolverLoop::new(
        Arc::clone(&store),
        Arc::clone(&signaling),
        Arc::clone(&reconnect),
        cancel.clone(),
    );
    tokio::spawn(resolver.run());

    let session_task = tokio::spawn(controller.run(signaling_rx, rtc_rx));

    shutdown_signal().await;
    info!("Shutdown requested");
    cancel.cancel();

    // Give the loops one grace period to close sockets and release the lease.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), session_task).await;
    rtc.reset().await;
    info!("Host stopped cleanly");
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
}
