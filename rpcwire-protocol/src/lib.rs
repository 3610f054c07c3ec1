//! # rpcwire-protocol
//!
//! Wire protocol for rpcwire, a length-prefixed request/response RPC.
//!
//! This crate provides:
//! - Varint length-prefixed framing
//! - Call headers (`method`, `seq`, `error`) and their wire encoding
//! - Pluggable payload serialization (JSON by default)
//! - Client and server codecs over any async byte stream

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod payload;
pub mod varint;

pub use codec::{ClientCodec, ClientSideCodec, ServerCodec, ServerSideCodec};
pub use error::ProtocolError;
pub use frame::{Frame, FrameReader, FrameWriter};
pub use message::{Header, Request, Response, ResponseBody};
pub use payload::{JsonCodec, PayloadCodec};

/// Default port for rpcwire servers.
pub const DEFAULT_PORT: u16 = 7410;

/// Maximum frame payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
