//! fastrpc - standalone RPC server
//!
//! Serves the built-in `echo` and `date` methods over the fastrpc protocol.

use fastrpc_protocol::RpcEncoder;
use fastrpc_server::{Config, Server};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

/// Ends the call with its own arguments.
fn echo(args: Vec<Value>, rpc: RpcEncoder) {
    if let Err(e) = rpc.send_end(args) {
        tracing::warn!("echo: {}", e);
    }
}

/// Ends the call with the current time.
fn date(_args: Vec<Value>, rpc: RpcEncoder) {
    let now = chrono::Utc::now();
    let result = rpc.send_end(vec![json!({
        "timestamp": now.timestamp_millis(),
        "iso": now.to_rfc3339(),
    })]);
    if let Err(e) = result {
        tracing::warn!("date: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // From file if FASTRPC_CONFIG is set, then env overrides.
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("FASTRPC_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if std::env::var("FASTRPC_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting fastrpc server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Unknown methods: {}",
        if config.rpc.check_defined {
            "rejected"
        } else {
            "ignored"
        }
    );

    let server = Server::new(config.server_config());
    server.rpc("echo", echo)?;
    server.rpc("date", date)?;

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.close();
    });

    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
