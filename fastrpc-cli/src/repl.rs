//! Interactive REPL.

use crate::commands;
use colored::Colorize;
use fastrpc_client::Client;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help
  <method> [args...]            Call a method; args are JSON or plain strings
  pending                       Number of calls awaiting completion
  state                         Connection state

  quit, exit                    Exit the REPL
"#;

/// What the REPL should do with one input line.
#[derive(Debug, PartialEq)]
enum Line<'a> {
    Empty,
    Help,
    Quit,
    Pending,
    State,
    Call { method: &'a str, args: Vec<String> },
}

fn parse_line(line: &str) -> Line<'_> {
    let mut parts = line.split_whitespace();
    let Some(first) = parts.next() else {
        return Line::Empty;
    };

    match first {
        "help" | "?" => Line::Help,
        "quit" | "exit" | "q" => Line::Quit,
        "pending" => Line::Pending,
        "state" => Line::State,
        method => Line::Call {
            method,
            args: parts.map(str::to_string).collect(),
        },
    }
}

pub async fn run(client: &Client, host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "fastrpc CLI".bold().cyan());
    println!("{} {}:{}", "Connected to".green(), host, port);

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".fastrpc_history"))
        .unwrap_or_else(|_| ".fastrpc_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "fastrpc>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => match parse_line(line.trim()) {
                Line::Empty => continue,
                Line::Help => println!("{}", HELP_TEXT),
                Line::Quit => break,
                Line::Pending => println!("{}\n", client.pending_count()),
                Line::State => println!("{:?}\n", client.state()),
                Line::Call { method, args } => {
                    let result = match commands::parse_args(&args) {
                        Ok(args) => {
                            commands::call(client, method, args, true, |item| {
                                println!("{}", item)
                            })
                            .await
                        }
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(n) => println!("{}\n", format!("({} items)", n).dimmed()),
                        Err(e) => println!("{}: {}\n", "Error".red(), e),
                    }
                }
            },
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    client.close();
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}
