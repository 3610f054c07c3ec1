//! Client and server codecs.
//!
//! A call travels as two frames in each direction:
//!
//! ```text
//! request:   [header{method, seq}]          [body]
//! response:  [header{method, seq, error?}]  [body | zero-length]
//! ```
//!
//! A zero-length response body means "no result": the client must not
//! decode it and should report the header's error instead.
//!
//! Both codecs own a [`FrameReader`] and a [`FrameWriter`] for one
//! connection. Every operation takes `&mut self`, so a codec is driven by
//! one task at a time. The read operations are cancel safe and can sit in
//! a `tokio::select!` branch next to writes.

use crate::error::ProtocolError;
use crate::frame::{FrameReader, FrameWriter};
use crate::message::{Header, Request, Response, ResponseBody};
use crate::payload::{JsonCodec, PayloadCodec};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

/// Server side of a connection: reads requests, writes responses.
pub trait ServerCodec {
    /// Reads the next request header.
    fn read_request_header(
        &mut self,
    ) -> impl Future<Output = Result<Request, ProtocolError>> + Send;

    /// Reads the request body and hands its bytes to `decode`.
    ///
    /// A decoder failure is returned as-is; the frame has been consumed, so
    /// the stream stays in sync.
    fn read_request_body<T, F>(
        &mut self,
        decode: F,
    ) -> impl Future<Output = Result<T, ProtocolError>> + Send
    where
        T: Send,
        F: FnOnce(&[u8]) -> Result<T, ProtocolError> + Send;

    /// Writes a response header followed by its body.
    fn write_response(
        &mut self,
        response: &Response,
        body: ResponseBody<'_>,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Shuts down the connection. Later calls do nothing.
    fn close(&mut self) -> impl Future<Output = Result<(), ProtocolError>> + Send;
}

/// Client side of a connection: writes requests, reads responses.
pub trait ClientCodec {
    /// Writes a request header followed by its body.
    fn write_request(
        &mut self,
        request: &Request,
        body: &[u8],
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Reads the next response header.
    ///
    /// A failed call is reported through [`Response::error`], not as an
    /// `Err`.
    fn read_response_header(
        &mut self,
    ) -> impl Future<Output = Result<Response, ProtocolError>> + Send;

    /// Reads the response body.
    ///
    /// Returns `Ok(None)` without calling `decode` when the body is empty.
    fn read_response_body<T, F>(
        &mut self,
        decode: F,
    ) -> impl Future<Output = Result<Option<T>, ProtocolError>> + Send
    where
        T: Send,
        F: FnOnce(&[u8]) -> Result<T, ProtocolError> + Send;

    /// Shuts down the connection. Later calls do nothing.
    fn close(&mut self) -> impl Future<Output = Result<(), ProtocolError>> + Send;
}

/// Reads one frame and decodes it as a header.
async fn read_header<R, P>(
    reader: &mut FrameReader<R>,
    payload_codec: &P,
) -> Result<Header, ProtocolError>
where
    R: AsyncRead + Unpin,
    P: PayloadCodec,
{
    let bytes = reader.read_frame().await?;
    Header::decode(payload_codec, &bytes)
}

/// Writes a header frame and a body frame as one unit.
async fn write_message<W, P>(
    writer: &mut FrameWriter<W>,
    payload_codec: &P,
    header: &Header,
    body: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    P: PayloadCodec,
{
    let header_bytes = header.encode(payload_codec)?;
    writer.feed(&header_bytes)?;
    if let Err(e) = writer.feed(body) {
        writer.discard();
        return Err(e);
    }
    writer.drain().await
}

/// Server-side codec over a split connection.
#[derive(Debug)]
pub struct ServerSideCodec<R, W, P = JsonCodec> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    payload_codec: P,
    closed: bool,
}

impl<S> ServerSideCodec<ReadHalf<S>, WriteHalf<S>, JsonCodec>
where
    S: AsyncRead + AsyncWrite,
{
    /// Creates a JSON codec over a duplex stream.
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, JsonCodec)
    }
}

impl<R, W, P> ServerSideCodec<R, W, P>
where
    P: PayloadCodec,
{
    pub fn new(reader: R, writer: W, payload_codec: P) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            payload_codec,
            closed: false,
        }
    }

    /// Sets the largest frame accepted or sent on this connection.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.reader.set_max_frame_size(max_frame_size);
        self.writer.set_max_frame_size(max_frame_size);
        self
    }

    pub fn payload_codec(&self) -> &P {
        &self.payload_codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<R, W, P> ServerCodec for ServerSideCodec<R, W, P>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    P: PayloadCodec,
{
    async fn read_request_header(&mut self) -> Result<Request, ProtocolError> {
        let header = read_header(&mut self.reader, &self.payload_codec).await?;
        tracing::trace!(method = %header.method, seq = header.seq, "request header");
        Ok(Request::from(header))
    }

    async fn read_request_body<T, F>(&mut self, decode: F) -> Result<T, ProtocolError>
    where
        T: Send,
        F: FnOnce(&[u8]) -> Result<T, ProtocolError> + Send,
    {
        let bytes = self.reader.read_frame().await?;
        decode(&bytes)
    }

    async fn write_response(
        &mut self,
        response: &Response,
        body: ResponseBody<'_>,
    ) -> Result<(), ProtocolError> {
        let header = Header::response(response.method.clone(), response.seq, response.error.clone());
        tracing::trace!(
            method = %header.method,
            seq = header.seq,
            error = header.is_error(),
            body_len = body.as_bytes().len(),
            "writing response"
        );
        write_message(&mut self.writer, &self.payload_codec, &header, body.as_bytes()).await
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await
    }
}

/// Client-side codec over a split connection.
#[derive(Debug)]
pub struct ClientSideCodec<R, W, P = JsonCodec> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    payload_codec: P,
    closed: bool,
}

impl<S> ClientSideCodec<ReadHalf<S>, WriteHalf<S>, JsonCodec>
where
    S: AsyncRead + AsyncWrite,
{
    /// Creates a JSON codec over a duplex stream.
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, JsonCodec)
    }
}

impl<R, W, P> ClientSideCodec<R, W, P>
where
    P: PayloadCodec,
{
    pub fn new(reader: R, writer: W, payload_codec: P) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            payload_codec,
            closed: false,
        }
    }

    /// Sets the largest frame accepted or sent on this connection.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.reader.set_max_frame_size(max_frame_size);
        self.writer.set_max_frame_size(max_frame_size);
        self
    }

    pub fn payload_codec(&self) -> &P {
        &self.payload_codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<R, W, P> ClientCodec for ClientSideCodec<R, W, P>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    P: PayloadCodec,
{
    async fn write_request(&mut self, request: &Request, body: &[u8]) -> Result<(), ProtocolError> {
        let header = Header::request(request.method.clone(), request.seq);
        tracing::trace!(method = %header.method, seq = header.seq, body_len = body.len(), "writing request");
        write_message(&mut self.writer, &self.payload_codec, &header, body).await
    }

    async fn read_response_header(&mut self) -> Result<Response, ProtocolError> {
        let header = read_header(&mut self.reader, &self.payload_codec).await?;
        tracing::trace!(
            method = %header.method,
            seq = header.seq,
            error = header.is_error(),
            "response header"
        );
        Ok(Response::from(header))
    }

    async fn read_response_body<T, F>(&mut self, decode: F) -> Result<Option<T>, ProtocolError>
    where
        T: Send,
        F: FnOnce(&[u8]) -> Result<T, ProtocolError> + Send,
    {
        let bytes = self.reader.read_frame().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        decode(&bytes).map(Some)
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await
    }
}
