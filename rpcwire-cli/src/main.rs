//! rpcwire-cli - Command-line client for rpcwire servers
//!
//! Provides both a REPL and one-shot calls.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use rpcwire_client::{Client, ConnectionConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rpcwire-cli")]
#[command(about = "Command-line client for rpcwire servers")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7410", env = "RPCWIRE_SERVER")]
    server: SocketAddr,

    /// Request timeout in seconds
    #[arg(short, long, default_value = "30")]
    timeout: u64,

    /// Largest frame sent or accepted, in bytes
    #[arg(long)]
    max_frame_size: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Call a method with a JSON argument
    Call {
        /// Method name, "Service.Method"
        method: String,

        /// Argument JSON (or @file.json to read from file)
        #[arg(default_value = "null")]
        args: String,

        /// Print the reply on one line
        #[arg(long)]
        compact: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ConnectionConfig::new(cli.server)
        .with_request_timeout(Duration::from_secs(cli.timeout));
    if let Some(size) = cli.max_frame_size {
        config = config.with_max_frame_size(size);
    }

    let client = Client::connect(config).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(&client, cli.server).await?;
        }
        Some(cmd) => match commands::execute(&client, cmd).await {
            Ok(output) => println!("{}", output),
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                let _ = client.close().await;
                std::process::exit(1);
            }
        },
    }

    client.close().await?;
    Ok(())
}
