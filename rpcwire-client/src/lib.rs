//! # rpcwire-client
//!
//! Client library for rpcwire.
//!
//! This crate provides:
//! - Async TCP client with a background connection driver
//! - Concurrent calls over one connection, matched by sequence number
//! - Typed (`call`) and untyped (`call_raw`) call APIs

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig, Reply};
pub use error::ClientError;
