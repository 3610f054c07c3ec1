//! Interactive REPL.

use crate::commands::{call, format_json};
use colored::Colorize;
use rpcwire_client::Client;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;

const HISTORY_FILE: &str = ".rpcwire_history";

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help
  <Service.Method> [json]       Call a method (argument defaults to null)
  call <Service.Method> [json]  Same as above

  quit, exit                    Exit the REPL
"#;

/// History file in the user's home directory, or the working directory
/// when there is none.
fn history_path() -> PathBuf {
    home::home_dir()
        .map(|h| h.join(HISTORY_FILE))
        .unwrap_or_else(|| PathBuf::from(HISTORY_FILE))
}

pub async fn run(client: &Client, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "rpcwire CLI".bold().cyan());
    println!("{} {}", "Connected to".green(), addr);

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = history_path();
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "rpcwire>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }

                if !client.is_connected() {
                    println!("{}", "Connection lost.".red());
                    break;
                }
            }
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
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

/// A parsed REPL line.
#[derive(Debug, PartialEq)]
enum ReplCommand<'a> {
    Help,
    Quit,
    Call { method: &'a str, args: &'a str },
    Usage(&'static str),
    Unknown(&'a str),
}

fn parse_line(line: &str) -> ReplCommand<'_> {
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    match head.to_lowercase().as_str() {
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" | "q" => ReplCommand::Quit,
        "call" => match rest.split_once(char::is_whitespace) {
            Some((method, args)) => ReplCommand::Call {
                method,
                args: args.trim(),
            },
            None if !rest.is_empty() => ReplCommand::Call {
                method: rest,
                args: "",
            },
            None => ReplCommand::Usage("Usage: call <Service.Method> [json]"),
        },
        _ if head.contains('.') => ReplCommand::Call { method: head, args: rest },
        _ => ReplCommand::Unknown(head),
    }
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    match parse_line(line) {
        ReplCommand::Help => Ok(Some(HELP_TEXT.to_string())),
        ReplCommand::Quit => Ok(None),
        ReplCommand::Usage(usage) => Ok(Some(usage.to_string())),
        ReplCommand::Unknown(cmd) => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
        ReplCommand::Call { method, args } => {
            let args: Value = if args.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(args)?
            };
            let reply = call(client, method, &args).await?;
            Ok(Some(format_json(&reply)))
        }
    }
}
