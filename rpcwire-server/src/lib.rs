//! # rpcwire-server
//!
//! TCP server for rpcwire.
//!
//! This crate provides:
//! - A registry of `"Service.Method"` handlers
//! - A connection loop that dispatches calls concurrently
//! - Layered configuration (defaults, YAML file, environment)

pub mod config;
pub mod error;
pub mod registry;
pub mod server;

pub use config::{Config, ConfigError, NetworkConfig, ProtocolConfig, CONFIG_ENV};
pub use error::ServerError;
pub use registry::{MethodHandler, Registry, TypedHandler};
pub use server::{Server, ServerConfig, ServerStats};
