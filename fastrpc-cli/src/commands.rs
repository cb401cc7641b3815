//! Command execution.

use crate::Commands;
use colored::Colorize;
use fastrpc_client::{CallEvent, Client};
use serde_json::{json, Value};
use std::time::Instant;

/// Executes a one-shot command, printing results as they arrive.
pub async fn execute(client: &Client, cmd: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Call {
            method,
            args,
            pretty,
        } => {
            let args = parse_args(&args)?;
            call(client, &method, args, pretty, |line| println!("{}", line)).await?;
            Ok(())
        }

        Commands::Ping { count } => {
            for seq in 0..count {
                let started = Instant::now();
                client
                    .rpc("echo", vec![json!({ "seq": seq })])
                    .collect()
                    .await?;
                println!(
                    "{} seq={} time={:.3}ms",
                    "PONG".green(),
                    seq,
                    started.elapsed().as_secs_f64() * 1000.0
                );
            }
            Ok(())
        }
    }
}

/// Runs one call, handing every data item to `out` as a JSON line.
///
/// Returns the number of items received.
pub async fn call(
    client: &Client,
    method: &str,
    args: Vec<Value>,
    pretty: bool,
    mut out: impl FnMut(String),
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut call = client.rpc(method, args);
    let mut items = 0;
    while let Some(event) = call.next().await {
        match event {
            CallEvent::Message(values) => {
                items += 1;
                out(format_item(&values, pretty));
            }
            CallEvent::End => break,
            CallEvent::Error(e) => return Err(format_error(&e).into()),
        }
    }
    Ok(items)
}

/// Parses call arguments. Each one is inline JSON, `@file.json`, or else a
/// plain string.
pub fn parse_args(raw: &[String]) -> Result<Vec<Value>, Box<dyn std::error::Error>> {
    raw.iter().map(|arg| parse_json_arg(arg)).collect()
}

fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string())))
    }
}

/// A single-value item prints as that value; otherwise as an array.
fn format_item(values: &[Value], pretty: bool) -> String {
    let value = match values {
        [single] => single.clone(),
        _ => Value::Array(values.to_vec()),
    };
    if pretty {
        format_json(&value)
    } else {
        value.to_string()
    }
}

fn format_error(err: &fastrpc_client::ClientError) -> String {
    match err.remote() {
        Some(remote) if !remote.context.is_empty() => {
            format!("{}: {} {}", remote.name, remote.message, Value::Object(remote.context.clone()))
        }
        Some(remote) => format!("{}: {}", remote.name, remote.message),
        None => format!("{}: {}", err.name(), err),
    }
}

/// Formats JSON for display.
pub fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
