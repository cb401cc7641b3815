//! fastrpc-cli - Command-line interface for fastrpc
//!
//! Provides both a REPL and one-shot calls.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use fastrpc_client::{Client, ClientConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fastrpc-cli")]
#[command(about = "Command-line interface for fastrpc servers")]
#[command(version)]
struct Cli {
    /// Server host
    #[arg(short = 'H', long, default_value = "127.0.0.1", env = "FASTRPC_HOST")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = fastrpc_protocol::DEFAULT_PORT, env = "FASTRPC_PORT")]
    port: u16,

    /// Connect timeout in milliseconds
    #[arg(long, default_value = "1000")]
    connect_timeout: u64,

    /// Connection retries before giving up
    #[arg(long, default_value = "3")]
    retries: u32,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start interactive REPL
    Repl,

    /// Call a method and print each result item as a JSON line
    Call {
        /// Method name
        method: String,

        /// Arguments: inline JSON, @file.json, or plain strings
        args: Vec<String>,

        /// Pretty-print results
        #[arg(long)]
        pretty: bool,
    },

    /// Round-trip the server's echo method
    Ping {
        /// Number of pings
        #[arg(short, long, default_value = "1")]
        count: u32,
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

    let config = ClientConfig::new(cli.host.clone(), cli.port)
        .with_connect_timeout(Duration::from_millis(cli.connect_timeout))
        .with_retry(fastrpc_client::RetryPolicy::new(cli.retries))
        .with_reconnect(false);
    let client = Client::new(config);

    if let Err(e) = client.connect().await {
        eprintln!(
            "{} to {}:{}: {}",
            "Connection failed".red(),
            cli.host,
            cli.port,
            e
        );
        std::process::exit(1);
    }

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(&client, &cli.host, cli.port).await?;
        }
        Some(cmd) => {
            if let Err(e) = commands::execute(&client, cmd).await {
                eprintln!("{}: {}", "Error".red(), e);
                client.close();
                std::process::exit(1);
            }
        }
    }

    client.close();
    Ok(())
}
