//! aot-compiler-service - AOT compiler daemon.
//!
//! Listens on a Unix socket, compiles on request and unloads itself after a
//! period of inactivity.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, info};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use aot_compiler::compiler::CompilerCore;
use aot_compiler::config::{AppConfig, LoggingConfig};
use aot_compiler::events::LocalEventBus;
use aot_compiler::server::AotCompilerServer;
use aot_compiler::service::AotCompilerService;
use aot_compiler::version::AOT_VERSION;

#[derive(Parser, Debug)]
#[command(
    name = "aot-compiler-service",
    version,
    about = "On-device AOT compiler service"
)]
struct Args {
    /// Path to config file.
    /// Defaults to ~/.config/aot-compiler/config.toml
    #[arg(short, long, env = "AOT_COMPILER_CONFIG")]
    config: Option<PathBuf>,

    /// Socket path to listen on (overrides the config file).
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,
}

fn init_logging(logging: &LoggingConfig, verbose: bool, json: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.to_lowercase()
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("aot_compiler={level}")));

    if json || logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .ok();
    }

    // Library code logs through the log crate
    let filter = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .filter_level(filter)
        .try_init()
        .ok();
}

async fn wait_for_signal(shutdown: CancellationToken) -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
        _ = shutdown.cancelled() => return Ok(()),
    }
    shutdown.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        config.service.socket_path = socket;
    }
    init_logging(&config.logging, args.verbose, args.json);

    info!(
        "starting aot-compiler-service (version={AOT_VERSION}, socket={:?}, signing={})",
        config.service.socket_path, config.signing.enabled
    );

    let shutdown = CancellationToken::new();
    let events = Arc::new(LocalEventBus::new());
    let core = Arc::new(CompilerCore::new(&config));
    let service = Arc::new(AotCompilerService::new(
        core,
        events.clone(),
        config.service.unload_delay(),
        shutdown.clone(),
    ));

    service.on_start();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    let server = AotCompilerServer::new(Arc::clone(&service), events);
    let result = server
        .run(&config.service.socket_path, shutdown.clone())
        .await;

    shutdown.cancel();
    service.on_stop();
    signals.await.context("joining signal task")??;
    result
}
