//! TCP server implementation.
//!
//! Each connection is served by one task. That task reads request headers
//! and bodies in order, spawns one task per call, and writes responses as
//! the calls complete, so responses may leave in a different order than
//! their requests arrived. The client matches them up by `seq`.

use crate::error::ServerError;
use crate::registry::{error_detail, Registry};
use rpcwire_protocol::{
    JsonCodec, PayloadCodec, ProtocolError, Request, Response, ResponseBody, ServerCodec,
    ServerSideCodec, DEFAULT_PORT, MAX_FRAME_SIZE,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::Instrument;

/// Responses queued per connection before call tasks wait for the writer.
const REPLY_CHANNEL_CAPACITY: usize = 256;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Largest frame accepted or sent on a connection.
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 1000,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// A finished call waiting to be written.
#[derive(Debug)]
struct Reply {
    response: Response,
    body: Option<Vec<u8>>,
}

impl Reply {
    fn ok(response: Response, body: Vec<u8>) -> Self {
        Self {
            response,
            body: Some(body),
        }
    }

    fn error(response: Response, error: impl Into<String>) -> Self {
        Self {
            response: response.with_error(error),
            body: None,
        }
    }
}

/// RPC server.
pub struct Server<P = JsonCodec> {
    config: ServerConfig,
    registry: Arc<Registry<P>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl<P: PayloadCodec> Server<P> {
    /// Creates a new server serving the methods in `registry`.
    pub fn new(config: ServerConfig, registry: Registry<P>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry: Arc::new(registry),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Runs the server on an already bound listener until [`Server::shutdown`].
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} ({} method(s))",
            local_addr,
            self.registry.len()
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            if let Err(e) = tcp_stream.set_nodelay(true) {
                                tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let registry = self.registry.clone();
                            let stats = self.stats.clone();
                            let max_frame_size = self.config.max_frame_size;
                            let conn_shutdown = self.shutdown.subscribe();
                            let span = tracing::info_span!("connection", peer = %addr);

                            tokio::spawn(
                                async move {
                                    tracing::info!("Client connected");
                                    let result = serve(
                                        tcp_stream,
                                        registry,
                                        stats.clone(),
                                        max_frame_size,
                                        conn_shutdown,
                                    )
                                    .await;

                                    if let Err(e) = result {
                                        tracing::debug!("Connection error: {}", e);
                                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                    }

                                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                    tracing::info!("Client disconnected");
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serves calls on one already open connection until the peer closes
    /// it, a fatal protocol error occurs, or the server shuts down.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let result = serve(
            stream,
            self.registry.clone(),
            self.stats.clone(),
            self.config.max_frame_size,
            self.shutdown.subscribe(),
        )
        .await;

        if result.is_err() {
            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        result.map_err(ServerError::from)
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn registry(&self) -> &Registry<P> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Connection loop.
async fn serve<S, P>(
    stream: S,
    registry: Arc<Registry<P>>,
    stats: Arc<ServerStats>,
    max_frame_size: usize,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    P: PayloadCodec,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut codec = ServerSideCodec::new(reader, writer, registry.payload_codec().clone())
        .with_max_frame_size(max_frame_size);
    let (reply_tx, mut reply_rx) = mpsc::channel::<Reply>(REPLY_CHANNEL_CAPACITY);

    let result = loop {
        tokio::select! {
            biased;

            Some(reply) = reply_rx.recv() => {
                if let Err(e) = write_reply(&mut codec, reply, &stats).await {
                    break Err(e);
                }
            }

            header = codec.read_request_header() => {
                let request = match header {
                    Ok(request) => request,
                    Err(e) => break Err(e),
                };
                if let Err(e) = dispatch(&mut codec, &registry, request, &reply_tx, &stats).await {
                    break Err(e);
                }
            }

            _ = shutdown.recv() => {
                tracing::debug!("Shutdown signal received");
                break Ok(());
            }
        }
    };

    // Calls already started still get their responses.
    drop(reply_tx);
    while let Some(reply) = reply_rx.recv().await {
        if let Err(e) = write_reply(&mut codec, reply, &stats).await {
            tracing::debug!("Dropping pending responses: {}", e);
            break;
        }
    }

    if let Err(e) = codec.close().await {
        tracing::trace!("Close error: {}", e);
    }

    match result {
        Err(e) if e.is_closed() => {
            tracing::debug!("Connection closed by client");
            Ok(())
        }
        other => other,
    }
}

/// Reads the body of `request` and starts the call.
///
/// Call-level failures are answered right away with an error response.
/// Only errors that leave the stream unusable are returned.
async fn dispatch<C, P>(
    codec: &mut C,
    registry: &Registry<P>,
    request: Request,
    reply_tx: &mpsc::Sender<Reply>,
    stats: &ServerStats,
) -> Result<(), ProtocolError>
where
    C: ServerCodec,
    P: PayloadCodec,
{
    stats.requests_total.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(method = %request.method, seq = request.seq, "Request");

    let response = Response::for_request(&request);

    let Some(handler) = registry.get(&request.method) else {
        // Consume the body to stay in sync.
        codec.read_request_body(|_| Ok(())).await?;
        let error = format!("rpc: can't find method {}", request.method);
        return write_reply(codec, Reply::error(response, error), stats).await;
    };

    let body = codec.read_request_body(|body| Ok(body.to_vec())).await?;
    match handler.prepare(registry.payload_codec(), &body) {
        Ok(call) => {
            let reply_tx = reply_tx.clone();
            tokio::spawn(
                async move {
                    // The call runs in its own task so a panicking handler
                    // still gets an answer.
                    let reply = match tokio::spawn(call.in_current_span()).await {
                        Ok(Ok(body)) => Reply::ok(response, body),
                        Ok(Err(error)) => Reply::error(response, error),
                        Err(e) if e.is_panic() => {
                            tracing::error!(
                                method = %response.method,
                                seq = response.seq,
                                "Handler panicked"
                            );
                            Reply::error(response, "rpc: handler panicked")
                        }
                        Err(_) => Reply::error(response, "rpc: call cancelled"),
                    };
                    // The connection is gone if the writer stopped listening.
                    let _ = reply_tx.send(reply).await;
                }
                .in_current_span(),
            );
            Ok(())
        }
        Err(e @ ProtocolError::PayloadDecode(_)) => {
            let error = format!("rpc: decoding request body: {}", error_detail(e));
            write_reply(codec, Reply::error(response, error), stats).await
        }
        Err(e) => Err(e),
    }
}

/// Writes one response.
///
/// A reply too large to send is replaced by an error response so that the
/// caller is not left waiting.
async fn write_reply<C: ServerCodec>(
    codec: &mut C,
    reply: Reply,
    stats: &ServerStats,
) -> Result<(), ProtocolError> {
    if reply.response.is_error() {
        stats.errors_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            method = %reply.response.method,
            seq = reply.response.seq,
            error = reply.response.error.as_deref().unwrap_or_default(),
            "Call failed"
        );
    }

    let body = match &reply.body {
        Some(bytes) => ResponseBody::Payload(bytes),
        None => ResponseBody::Invalid,
    };

    match codec.write_response(&reply.response, body).await {
        Err(ProtocolError::FrameTooLarge { size, max }) => {
            tracing::warn!(
                method = %reply.response.method,
                seq = reply.response.seq,
                size,
                max,
                "Response too large"
            );
            stats.errors_total.fetch_add(1, Ordering::Relaxed);
            let response = reply.response.with_error(format!(
                "rpc: response too large: {} bytes (max {})",
                size, max
            ));
            codec.write_response(&response, ResponseBody::Invalid).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcwire_protocol::{ClientCodec, ClientSideCodec, FrameWriter};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type TestClient = ClientSideCodec<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    #[derive(Debug, Serialize, Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    fn test_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register("Echo.Say", |s: String| async move { Ok::<_, String>(s) })
            .unwrap();
        registry
            .register("Arith.Divide", |args: AddArgs| async move {
                if args.b == 0 {
                    Err("divide by zero".to_string())
                } else {
                    Ok(args.a / args.b)
                }
            })
            .unwrap();
        registry
            .register("Clock.Sleep", |millis: u64| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, String>(millis)
            })
            .unwrap();
        registry
    }

    fn test_server(config: ServerConfig) -> Arc<Server> {
        Arc::new(Server::new(config, test_registry()))
    }

    /// Starts serving one end of an in-memory pipe and returns a codec for
    /// the other end.
    fn connect(
        server: &Arc<Server>,
    ) -> (
        TestClient,
        tokio::task::JoinHandle<Result<(), ServerError>>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = server.clone();
        let handle = tokio::spawn(async move { server.serve_connection(b).await });
        (ClientSideCodec::from_stream(a), handle)
    }

    async fn call(client: &mut TestClient, method: &str, seq: u64, body: &[u8]) {
        client
            .write_request(&Request::new(method, seq), body)
            .await
            .unwrap();
    }

    async fn read_reply(client: &mut TestClient) -> (Response, Option<Vec<u8>>) {
        let response = client.read_response_header().await.unwrap();
        let body = client
            .read_response_body(|b| Ok(b.to_vec()))
            .await
            .unwrap();
        (response, body)
    }

    #[tokio::test]
    async fn test_echo_call() {
        let server = test_server(ServerConfig::default());
        let (mut client, handle) = connect(&server);

        call(&mut client, "Echo.Say", 1, br#""hi""#).await;
        let (response, body) = read_reply(&mut client).await;
        assert_eq!(response, Response::ok("Echo.Say", 1));
        assert_eq!(body.as_deref(), Some(&br#""hi""#[..]));

        client.close().await.unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(server.stats().requests_total.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats().connections_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_handler_error() {
        let server = test_server(ServerConfig::default());
        let (mut client, _handle) = connect(&server);

        call(&mut client, "Arith.Divide", 7, br#"{"a":1,"b":0}"#).await;
        let (response, body) = read_reply(&mut client).await;
        assert_eq!(response.seq, 7);
        assert_eq!(response.error.as_deref(), Some("divide by zero"));
        assert!(body.is_none());
    }

    #[tokio::test]
    async fn test_handler_panic_is_answered() {
        let server = test_server(ServerConfig::default());
        let (mut client, _handle) = connect(&server);

        call(&mut client, "Arith.Divide", 5, br#"{"a":-9223372036854775808,"b":-1}"#).await;
        let (response, body) = tokio::time::timeout(Duration::from_secs(2), read_reply(&mut client))
            .await
            .unwrap();
        assert_eq!(response.seq, 5);
        assert_eq!(response.error.as_deref(), Some("rpc: handler panicked"));
        assert!(body.is_none());

        // Other calls on the connection are unaffected.
        call(&mut client, "Echo.Say", 6, br#""alive""#).await;
        let (response, body) = read_reply(&mut client).await;
        assert_eq!(response, Response::ok("Echo.Say", 6));
        assert_eq!(body.as_deref(), Some(&br#""alive""#[..]));
    }

    #[tokio::test]
    async fn test_unknown_method_keeps_stream_in_sync() {
        let server = test_server(ServerConfig::default());
        let (mut client, _handle) = connect(&server);

        call(&mut client, "Nope.Missing", 1, br#"{"ignored":true}"#).await;
        call(&mut client, "Echo.Say", 2, br#""after""#).await;

        let (response, body) = read_reply(&mut client).await;
        assert_eq!(response.seq, 1);
        assert_eq!(
            response.error.as_deref(),
            Some("rpc: can't find method Nope.Missing")
        );
        assert!(body.is_none());

        let (response, body) = read_reply(&mut client).await;
        assert_eq!(response, Response::ok("Echo.Say", 2));
        assert_eq!(body.as_deref(), Some(&br#""after""#[..]));
    }

    #[tokio::test]
    async fn test_bad_request_body() {
        let server = test_server(ServerConfig::default());
        let (mut client, _handle) = connect(&server);

        call(&mut client, "Arith.Divide", 3, b"{not json").await;
        let (response, body) = read_reply(&mut client).await;
        let error = response.error.unwrap();
        assert!(error.starts_with("rpc: decoding request body: "), "{}", error);
        assert!(body.is_none());

        // The connection is still usable.
        call(&mut client, "Echo.Say", 4, br#""ok""#).await;
        let (response, _) = read_reply(&mut client).await;
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_pipelined_calls_complete_out_of_order() {
        let server = test_server(ServerConfig::default());
        let (mut client, _handle) = connect(&server);

        call(&mut client, "Clock.Sleep", 1, b"200").await;
        call(&mut client, "Echo.Say", 2, br#""fast""#).await;

        let (first, _) = read_reply(&mut client).await;
        let (second, body) = read_reply(&mut client).await;
        assert_eq!(first.seq, 2);
        assert_eq!(second.seq, 1);
        assert_eq!(body.as_deref(), Some(&b"200"[..]));
    }

    #[tokio::test]
    async fn test_malformed_header_closes_connection() {
        let server = test_server(ServerConfig::default());
        let (a, b) = tokio::io::duplex(1024);
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_connection(b).await })
        };

        let mut raw = FrameWriter::new(a);
        raw.write_frame(br#"{"method":"Echo.Say"}"#).await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ServerError::Protocol(ProtocolError::MalformedHeader(_))
        ));
        assert_eq!(server.stats().errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_oversized_request_closes_connection() {
        let server = test_server(ServerConfig::default().with_max_frame_size(64));
        let (mut client, handle) = connect(&server);

        call(&mut client, "Echo.Say", 1, &[b'x'; 100]).await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ServerError::Protocol(ProtocolError::FrameTooLarge { size: 100, max: 64 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_response_becomes_error() {
        let mut registry = Registry::new();
        registry
            .register("Big.Reply", |n: usize| async move {
                Ok::<_, String>("z".repeat(n))
            })
            .unwrap();
        let server = Arc::new(Server::new(
            ServerConfig::default().with_max_frame_size(128),
            registry,
        ));
        let (mut client, _handle) = connect(&server);

        call(&mut client, "Big.Reply", 9, b"200").await;
        call(&mut client, "Big.Reply", 10, b"3").await;

        let (response, body) = read_reply(&mut client).await;
        assert_eq!(response.seq, 9);
        let error = response.error.unwrap();
        assert!(error.starts_with("rpc: response too large"), "{}", error);
        assert!(body.is_none());

        let (response, body) = read_reply(&mut client).await;
        assert_eq!(response.seq, 10);
        assert_eq!(body.as_deref(), Some(&br#""zzz""#[..]));
    }

    #[tokio::test]
    async fn test_peer_close_is_orderly() {
        let server = test_server(ServerConfig::default());
        let (client, handle) = connect(&server);
        drop(client);
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(server.stats().errors_total.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_pending_call_answered_after_client_half_close() {
        let server = test_server(ServerConfig::default());
        let (mut client, handle) = connect(&server);

        call(&mut client, "Clock.Sleep", 5, b"50").await;
        // Shuts down our write side only; responses can still arrive.
        client.close().await.unwrap();

        let (response, body) = read_reply(&mut client).await;
        assert_eq!(response.seq, 5);
        assert_eq!(body.as_deref(), Some(&b"50"[..]));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_and_shutdown() {
        let server = test_server(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.run_with_listener(listener).await })
        };

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut client = ClientSideCodec::from_stream(stream);
        client
            .write_request(&Request::new("Echo.Say", 1), br#""tcp""#)
            .await
            .unwrap();
        let response = client.read_response_header().await.unwrap();
        assert_eq!(response.seq, 1);
        assert!(server.is_running());

        server.shutdown();
        handle.await.unwrap().unwrap();
        assert!(!server.is_running());
    }
}
