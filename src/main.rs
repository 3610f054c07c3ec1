//! rpcwire - RPC server
//!
//! Serves a small set of built-in services over the rpcwire protocol.

use rpcwire_server::{Config, Registry, Server, ServerError, CONFIG_ENV};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct ArithArgs {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize)]
struct Quotient {
    quo: i64,
    rem: i64,
}

/// Registers the built-in services.
fn builtin_registry() -> Result<Registry, ServerError> {
    let mut registry = Registry::new();

    registry.register("Echo.Say", |text: String| async move { Ok::<_, String>(text) })?;
    registry.register("Echo.Fail", |text: String| async move { Err::<(), _>(text) })?;

    registry.register("Arith.Add", |args: ArithArgs| async move {
        args.a
            .checked_add(args.b)
            .ok_or_else(|| "integer overflow".to_string())
    })?;
    registry.register("Arith.Multiply", |args: ArithArgs| async move {
        args.a
            .checked_mul(args.b)
            .ok_or_else(|| "integer overflow".to_string())
    })?;
    registry.register("Arith.Divide", |args: ArithArgs| async move {
        if args.b == 0 {
            return Err("divide by zero".to_string());
        }
        match (args.a.checked_div(args.b), args.a.checked_rem(args.b)) {
            (Some(quo), Some(rem)) => Ok(Quotient { quo, rem }),
            _ => Err("integer overflow".to_string()),
        }
    })?;

    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load() {
        Ok(config) => {
            if let Ok(path) = std::env::var(CONFIG_ENV) {
                tracing::info!("Loaded config from {}", path);
            }
            config
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting rpcwire server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!("  Max frame size: {} bytes", config.protocol.max_frame_size);

    let registry = builtin_registry()?;
    tracing::info!("  Methods: {}", registry.methods().join(", "));

    let server = Arc::new(Server::new(config.server_config(), registry));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    server.run().await?;

    let stats = server.stats();
    tracing::info!(
        "Server stopped ({} connection(s), {} request(s))",
        stats
            .connections_total
            .load(std::sync::atomic::Ordering::Relaxed),
        stats.requests_total.load(std::sync::atomic::Ordering::Relaxed)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_methods() {
        let registry = builtin_registry().unwrap();
        assert_eq!(
            registry.methods(),
            vec![
                "Arith.Add",
                "Arith.Divide",
                "Arith.Multiply",
                "Echo.Fail",
                "Echo.Say"
            ]
        );
    }

    #[tokio::test]
    async fn test_echo_fail_returns_text() {
        let registry = builtin_registry().unwrap();
        let handler = registry.get("Echo.Fail").unwrap();
        let result = handler
            .prepare(registry.payload_codec(), br#""boom""#)
            .unwrap()
            .await;
        assert_eq!(result.unwrap_err(), "boom");
    }

    #[tokio::test]
    async fn test_divide() {
        let registry = builtin_registry().unwrap();
        let handler = registry.get("Arith.Divide").unwrap();
        let reply = handler
            .prepare(registry.payload_codec(), br#"{"a":7,"b":2}"#)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(reply, br#"{"quo":3,"rem":1}"#);
    }

    #[tokio::test]
    async fn test_divide_overflow() {
        let registry = builtin_registry().unwrap();
        let handler = registry.get("Arith.Divide").unwrap();
        let result = handler
            .prepare(
                registry.payload_codec(),
                br#"{"a":-9223372036854775808,"b":-1}"#,
            )
            .unwrap()
            .await;
        assert_eq!(result.unwrap_err(), "integer overflow");

        let result = handler
            .prepare(registry.payload_codec(), br#"{"a":1,"b":0}"#)
            .unwrap()
            .await;
        assert_eq!(result.unwrap_err(), "divide by zero");
    }
}
