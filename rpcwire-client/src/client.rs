//! High-level client API.

use crate::connection::{Connection, ConnectionConfig, Reply};
use crate::error::ClientError;
use bytes::Bytes;
use rpcwire_protocol::{JsonCodec, PayloadCodec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// High-level client for rpcwire.
///
/// Cloning is cheap; clones share the connection, so calls from several
/// tasks are multiplexed over it.
#[derive(Clone)]
pub struct Client<P = JsonCodec> {
    conn: Arc<Connection>,
    codec: P,
}

impl Client<JsonCodec> {
    /// Connects to the server with JSON payloads.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        Self::connect_with_codec(config, JsonCodec).await
    }

    /// Wraps an already open duplex stream with JSON payloads.
    pub fn from_stream<S>(stream: S, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_stream_with_codec(stream, config, JsonCodec)
    }
}

impl<P: PayloadCodec> Client<P> {
    pub async fn connect_with_codec(config: ConnectionConfig, codec: P) -> Result<Self, ClientError> {
        let conn = Connection::connect(config, codec.clone()).await?;
        Ok(Self {
            conn: Arc::new(conn),
            codec,
        })
    }

    pub fn from_stream_with_codec<S>(stream: S, config: ConnectionConfig, codec: P) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Connection::from_stream(stream, config, codec.clone());
        Self {
            conn: Arc::new(conn),
            codec,
        }
    }

    /// Calls `method` with `args` and decodes the reply.
    ///
    /// A failure reported by the server comes back as
    /// [`ClientError::Server`] with the server's text.
    pub async fn call<Req, Resp>(&self, method: &str, args: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = self.codec.encode(args)?;
        let reply = self.conn.request(method, body).await?;
        let bytes = Self::into_body(reply)?;
        Ok(self.codec.decode(&bytes)?)
    }

    /// Calls `method` with an already encoded argument and returns the
    /// encoded reply.
    pub async fn call_raw(&self, method: &str, body: Vec<u8>) -> Result<Bytes, ClientError> {
        let reply = self.conn.request(method, body).await?;
        Self::into_body(reply)
    }

    fn into_body(reply: Reply) -> Result<Bytes, ClientError> {
        if let Some(error) = reply.response.error {
            return Err(ClientError::Server(error));
        }
        reply.body.ok_or(ClientError::MissingBody)
    }

    /// Returns whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection. Safe to call more than once.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    pub fn payload_codec(&self) -> &P {
        &self.codec
    }
}
