//! Command execution.

use crate::Commands;
use rpcwire_client::Client;
use serde_json::Value;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Call {
            method,
            args,
            compact,
        } => {
            let reply = call(client, &method, &parse_json_arg(&args)?).await?;
            if compact {
                Ok(reply.to_string())
            } else {
                Ok(format_json(&reply))
            }
        }
    }
}

/// Calls `method` with a JSON argument and returns the JSON reply.
///
/// The argument and reply travel as raw bytes, so the reply is shown as
/// the server encoded it.
pub async fn call(
    client: &Client,
    method: &str,
    args: &Value,
) -> Result<Value, Box<dyn std::error::Error>> {
    let body = serde_json::to_vec(args)?;
    let reply = client.call_raw(method, body).await?;
    Ok(serde_json::from_slice(&reply)?)
}

/// Parses a JSON argument, reading it from a file when prefixed with `@`.
pub fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
pub fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
