//! Connection management.
//!
//! A [`Connection`] owns a driver task that holds the client codec. Calls
//! are handed to the driver over a channel; the driver writes them, keeps
//! a table of pending calls keyed by `seq`, and routes each response back
//! to its caller. Many calls can be in flight on one connection.

use crate::error::ClientError;
use bytes::Bytes;
use rpcwire_protocol::{
    ClientCodec, ClientSideCodec, PayloadCodec, ProtocolError, Request, Response, MAX_FRAME_SIZE,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Calls queued for the driver before callers wait.
const REQUEST_CHANNEL_CAPACITY: usize = 256;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
    /// Largest frame accepted or sent.
    pub max_frame_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

/// A response as delivered to the caller.
#[derive(Debug)]
pub struct Reply {
    pub response: Response,
    /// `None` when the server sent an empty body.
    pub body: Option<Bytes>,
}

/// A call on its way to the driver.
struct Outgoing {
    request: Request,
    body: Vec<u8>,
    reply: oneshot::Sender<Result<Reply, ClientError>>,
}

/// A connection to an rpcwire server.
pub struct Connection {
    config: ConnectionConfig,
    requests: mpsc::Sender<Outgoing>,
    cancels: mpsc::UnboundedSender<u64>,
    next_seq: AtomicU64,
    pending_calls: Arc<AtomicUsize>,
    connected: Arc<AtomicBool>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Dials `config.addr` and starts the driver.
    pub async fn connect<P: PayloadCodec>(
        config: ConnectionConfig,
        payload_codec: P,
    ) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);

        let tcp_stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::Timeout
            })?
            .map_err(|e| {
                tracing::debug!("Connection failed: {}", e);
                ClientError::Io(e)
            })?;

        tcp_stream.set_nodelay(true).ok();
        tracing::debug!("Connected to {}", config.addr);

        Ok(Self::from_stream(tcp_stream, config, payload_codec))
    }

    /// Starts the driver over an already open duplex stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S, P>(stream: S, config: ConnectionConfig, payload_codec: P) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        P: PayloadCodec,
    {
        let (reader, writer) = tokio::io::split(stream);
        let codec = ClientSideCodec::new(reader, writer, payload_codec)
            .with_max_frame_size(config.max_frame_size);
        Self::from_codec(codec, config)
    }

    /// Starts the driver over any client codec.
    pub fn from_codec<C>(codec: C, config: ConnectionConfig) -> Self
    where
        C: ClientCodec + Send + 'static,
    {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (cancels_tx, cancels_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let connected = Arc::new(AtomicBool::new(true));
        let pending_calls = Arc::new(AtomicUsize::new(0));

        let driver = tokio::spawn(drive(
            codec,
            requests_rx,
            cancels_rx,
            close_rx,
            connected.clone(),
            pending_calls.clone(),
        ));

        Self {
            config,
            requests: requests_tx,
            cancels: cancels_tx,
            next_seq: AtomicU64::new(1),
            pending_calls,
            connected,
            close_tx: Mutex::new(Some(close_tx)),
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Sends a call and waits for its response.
    pub async fn request(&self, method: &str, body: Vec<u8>) -> Result<Reply, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::ConnectionClosed);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(method, seq, "Sending request");

        let (tx, rx) = oneshot::channel();
        let outgoing = Outgoing {
            request: Request::new(method, seq),
            body,
            reply: tx,
        };

        self.requests
            .send(outgoing)
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        tokio::time::timeout(self.config.request_timeout, rx)
            .await
            .map_err(|_| {
                tracing::debug!(method, seq, "Request timed out");
                // A late response for this seq is discarded by the driver.
                let _ = self.cancels.send(seq);
                ClientError::Timeout
            })?
            .map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Returns whether the driver is still running.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns the number of calls written and still awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending_calls.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Closes the connection and waits for the driver to stop.
    ///
    /// Calls still in flight fail with `ConnectionClosed`. Closing twice is
    /// a no-op.
    pub async fn close(&self) -> Result<(), ClientError> {
        if let Some(close_tx) = self.close_tx.lock().await.take() {
            tracing::debug!("Closing connection...");
            let _ = close_tx.send(());
        }
        if let Some(driver) = self.driver.lock().await.take() {
            let _ = driver.await;
        }
        Ok(())
    }
}

/// Driver loop. Owns the codec for the lifetime of the connection.
async fn drive<C: ClientCodec>(
    mut codec: C,
    mut requests: mpsc::Receiver<Outgoing>,
    mut cancels: mpsc::UnboundedReceiver<u64>,
    mut close_rx: oneshot::Receiver<()>,
    connected: Arc<AtomicBool>,
    pending_calls: Arc<AtomicUsize>,
) {
    let mut pending: HashMap<u64, oneshot::Sender<Result<Reply, ClientError>>> = HashMap::new();

    let result: Result<(), ProtocolError> = loop {
        tokio::select! {
            biased;

            _ = &mut close_rx => break Ok(()),

            Some(seq) = cancels.recv() => {
                if pending.remove(&seq).is_some() {
                    pending_calls.store(pending.len(), Ordering::SeqCst);
                }
            }

            header = codec.read_response_header() => {
                let response = match header {
                    Ok(response) => response,
                    Err(e) => break Err(e),
                };
                let body = match codec
                    .read_response_body(|bytes| Ok(Bytes::copy_from_slice(bytes)))
                    .await
                {
                    Ok(body) => body,
                    Err(e) => break Err(e),
                };

                let caller = pending.remove(&response.seq);
                pending_calls.store(pending.len(), Ordering::SeqCst);
                match caller {
                    Some(tx) => {
                        // The caller may have timed out and gone away.
                        let _ = tx.send(Ok(Reply { response, body }));
                    }
                    None => tracing::warn!(
                        method = %response.method,
                        seq = response.seq,
                        "Discarding response for unknown call"
                    ),
                }
            }

            outgoing = requests.recv() => {
                let Some(outgoing) = outgoing else {
                    // Every handle is gone.
                    break Ok(());
                };

                match codec.write_request(&outgoing.request, &outgoing.body).await {
                    Ok(()) => {
                        // Callers that went away without a timeout.
                        pending.retain(|_, tx| !tx.is_closed());
                        pending.insert(outgoing.request.seq, outgoing.reply);
                        pending_calls.store(pending.len(), Ordering::SeqCst);
                    }
                    Err(e @ ProtocolError::FrameTooLarge { .. }) | Err(e @ ProtocolError::PayloadEncode(_)) => {
                        // Nothing reached the wire.
                        let _ = outgoing.reply.send(Err(ClientError::Protocol(e)));
                    }
                    Err(e) => {
                        let _ = outgoing.reply.send(Err(ClientError::ConnectionClosed));
                        break Err(e);
                    }
                }
            }
        }
    };

    connected.store(false, Ordering::SeqCst);

    match &result {
        Ok(()) => tracing::debug!("Connection closed"),
        Err(e) if e.is_closed() => tracing::debug!("Connection closed by server"),
        Err(e) => tracing::warn!("Connection failed: {}", e),
    }

    if !pending.is_empty() {
        tracing::debug!("Failing {} pending request(s)", pending.len());
    }
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(ClientError::ConnectionClosed));
    }
    pending_calls.store(0, Ordering::SeqCst);

    // Calls queued after the driver stopped reading.
    requests.close();
    while let Ok(outgoing) = requests.try_recv() {
        let _ = outgoing.reply.send(Err(ClientError::ConnectionClosed));
    }

    if let Err(e) = codec.close().await {
        tracing::trace!("Close error: {}", e);
    }
}
