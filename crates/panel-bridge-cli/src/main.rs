//! panel-bridge CLI
//!
//! Talks to a running panel-bridged and validates its configuration.

mod client;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use serde_json::Value;

use crate::client::{check_reply, parse_arg, BridgeClient};

#[derive(Parser, Debug)]
#[command(name = "panel-bridge")]
#[command(about = "Command-line client for the panel-bridge daemon")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/panel-bridge/config.kdl")]
    config: String,

    /// Daemon socket path (overrides config setting)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a command to the daemon and print the reply
    Send {
        /// Command name
        command: String,

        /// Arguments; each is parsed as JSON if possible, otherwise sent as a string
        args: Vec<String>,
    },

    /// Print compositor events as they are broadcast
    Watch {
        /// Only print events of this type
        #[arg(short, long)]
        event: Option<String>,
    },

    /// Show daemon status
    Status,

    /// List commands the daemon understands
    Commands,

    /// Validate the configuration file
    Validate,
}

fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Expand tilde in config path
    let config_path: PathBuf = shellexpand::tilde(&cli.config).into_owned().into();

    let socket = cli.socket;
    let socket_path = || -> miette::Result<PathBuf> {
        match &socket {
            Some(path) => Ok(path.clone()),
            None => Ok(panel_bridge_config::load_config(&config_path)?
                .server
                .resolve_socket_path()),
        }
    };

    match cli.command {
        Commands::Validate => cmd_validate(&config_path),
        Commands::Send { command, args } => cmd_send(&socket_path()?, &command, &args),
        Commands::Watch { event } => cmd_watch(&socket_path()?, event.as_deref()),
        Commands::Status => cmd_status(&socket_path()?),
        Commands::Commands => cmd_commands(&socket_path()?),
    }
}

fn print_json(value: &Value) -> miette::Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

fn cmd_validate(config_path: &Path) -> miette::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = panel_bridge_config::parse_config(config_path)?;

    println!("Configuration is valid!");
    println!("  Socket: {}", config.server.resolve_socket_path().display());
    println!("  Backend: {:?}", config.compositor.backend);
    println!(
        "  Event queue: {} events, {:?} when full",
        config.events.queue_capacity, config.events.backpressure
    );
    Ok(())
}

fn cmd_send(socket_path: &Path, command: &str, args: &[String]) -> miette::Result<()> {
    let mut client = BridgeClient::connect(socket_path)?;
    let args = args.iter().map(|arg| parse_arg(arg)).collect();
    let reply = client.request(command, args)?;
    print_json(&reply)?;
    check_reply(reply).map(|_| ())
}

fn cmd_watch(socket_path: &Path, event_type: Option<&str>) -> miette::Result<()> {
    let mut client = BridgeClient::connect(socket_path)?;

    while let Some(message) = client.next_message()? {
        let kind = message.get("event").and_then(Value::as_str);
        if event_type.is_none() || kind == event_type {
            println!("{}", message);
        }
    }

    eprintln!("Daemon closed the connection");
    Ok(())
}

fn cmd_status(socket_path: &Path) -> miette::Result<()> {
    let mut client = BridgeClient::connect(socket_path)?;
    let reply = check_reply(client.request("get_status_data", Vec::new())?)?;
    let data = &reply["data"];

    println!("panel-bridge daemon");
    println!("  Socket: {}", data["socket"].as_str().unwrap_or("?"));
    println!(
        "  Compositor: {} ({})",
        data["compositor"]["backend"].as_str().unwrap_or("none"),
        data["compositor"]["state"].as_str().unwrap_or("unknown")
    );
    println!("  Clients: {}", data["clients"]);
    println!("  Commands: {}", data["commands"]);
    println!(
        "  Queue: {}/{} ({} dropped)",
        data["queue"]["depth"], data["queue"]["capacity"], data["queue"]["dropped"]
    );
    Ok(())
}

fn cmd_commands(socket_path: &Path) -> miette::Result<()> {
    let mut client = BridgeClient::connect(socket_path)?;
    let reply = check_reply(client.request("list_commands", Vec::new())?)?;

    for name in reply["data"].as_array().into_iter().flatten() {
        if let Some(name) = name.as_str() {
            println!("{}", name);
        }
    }
    Ok(())
}
