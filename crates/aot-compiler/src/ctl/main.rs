//! aotctl - Control CLI for the AOT compiler service.
//!
//! Sends compile, stop and version requests through the service client, and
//! can inject device events for testing admission control.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;

use aot_compiler::client::AotCompilerClient;
use aot_compiler::config::{AppConfig, default_config_path};
use aot_compiler::protocol::{CompileOutcome, RequestArgs, SystemEvent};

fn main() -> ExitCode {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "Error: {err:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let client = || connect(cli.config.as_deref(), cli.socket.clone());

    match cli.command {
        Command::Compile { ref args } => handle_compile(&client()?, args, cli.json).await,
        Command::Stop => {
            client()?.stop_aot_compiler().await?;
            print_result(cli.json, json!({ "stopped": true }), "stopped")
        }
        Command::Version => {
            let version = client()?.get_aot_version().await?;
            print_result(cli.json, json!({ "version": version }), &version)
        }
        Command::NeedRecompile { ref old_version } => {
            let need = client()?.need_re_compile(old_version).await?;
            print_result(cli.json, json!({ "need": need }), &need.to_string())
        }
        Command::Event { event } => {
            client()?.send_event(event.into()).await?;
            print_result(cli.json, json!({ "sent": true }), "sent")
        }
        Command::InitConfig { force } => handle_init_config(cli.config.clone(), force),
    }
}

fn connect(config: Option<&Path>, socket: Option<PathBuf>) -> Result<AotCompilerClient> {
    let config = AppConfig::load(config)?;
    let socket_path = socket.unwrap_or(config.service.socket_path);
    Ok(AotCompilerClient::from_config(&config.client, socket_path))
}

#[derive(Debug, Parser)]
#[command(
    name = "aotctl",
    author,
    version,
    about = "Control CLI for the AOT compiler service."
)]
struct Cli {
    /// Socket path of the service (defaults to the configured one)
    #[arg(long, short = 's', env = "AOT_COMPILER_SOCKET")]
    socket: Option<PathBuf>,

    /// Output machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Path to config file
    #[arg(long, short = 'c', env = "AOT_COMPILER_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile an application; arguments are KEY=VALUE pairs
    Compile {
        #[arg(required = true, value_name = "KEY=VALUE")]
        args: Vec<String>,
    },

    /// Stop the running compile
    Stop,

    /// Print the AN file version the service produces
    Version,

    /// Check whether artifacts of OLD_VERSION must be rebuilt
    NeedRecompile { old_version: String },

    /// Send a device event to the service
    Event {
        #[command(subcommand)]
        event: EventCommand,
    },

    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
enum EventCommand {
    /// The charger was unplugged
    PowerDisconnected,
    /// The screen turned on
    ScreenOn,
    /// The thermal level changed
    Thermal { level: i32 },
}

impl From<EventCommand> for SystemEvent {
    fn from(cmd: EventCommand) -> Self {
        match cmd {
            EventCommand::PowerDisconnected => SystemEvent::PowerDisconnected,
            EventCommand::ScreenOn => SystemEvent::ScreenOn,
            EventCommand::Thermal { level } => SystemEvent::ThermalLevelChanged(level),
        }
    }
}

fn parse_key_values(pairs: &[String]) -> Result<RequestArgs> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("expected KEY=VALUE, got {pair:?}"))?;
            if key.is_empty() {
                bail!("empty key in {pair:?}");
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

async fn handle_compile(client: &AotCompilerClient, pairs: &[String], json: bool) -> Result<()> {
    let args = parse_key_values(pairs)?;
    match client.aot_compiler(&args).await? {
        CompileOutcome::Signed { signature } => print_result(
            json,
            json!({ "status": "signed", "signature_len": signature.len() }),
            &format!("compiled and signed ({} signature bytes)", signature.len()),
        ),
        CompileOutcome::NoArtifact => print_result(
            json,
            json!({ "status": "no_artifact" }),
            "compiled, no artifact produced",
        ),
    }
}

fn handle_init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AppConfig::write_default(&path)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn print_result(json: bool, value: serde_json::Value, text: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{text}");
    }
    Ok(())
}
