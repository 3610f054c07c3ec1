//! Length-prefixed framing.
//!
//! Frame layout:
//!
//! ```text
//! +------------------+----------------+
//! | length (uvarint) | payload        |
//! | 1..=10 bytes     | length bytes   |
//! +------------------+----------------+
//! ```
//!
//! The length is the shortest base-128 encoding of the payload size. There
//! is no padding, magic or checksum; a zero-length frame is legal and is
//! used by responses to signal "no body".

use crate::error::ProtocolError;
use crate::varint;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Creates a zero-length frame.
    pub fn empty() -> Self {
        Self {
            payload: Bytes::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        varint::encoded_len(self.payload.len() as u64) + self.payload.len()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        encode_into(&self.payload, &mut buf, MAX_FRAME_SIZE)?;
        Ok(buf)
    }

    /// Decodes a frame from bytes using the default size limit.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        Self::decode_with_limit(buf, MAX_FRAME_SIZE)
    }

    /// Decodes a frame from bytes, rejecting payloads above `max_frame_size`.
    ///
    /// The limit is checked as soon as the length prefix is complete, before
    /// waiting for (or allocating) the payload. Nothing is consumed from
    /// `buf` unless a whole frame is returned.
    pub fn decode_with_limit(
        buf: &mut BytesMut,
        max_frame_size: usize,
    ) -> Result<Option<Self>, ProtocolError> {
        let Some((len, prefix_len)) = varint::decode(&buf[..])? else {
            return Ok(None);
        };

        if len > max_frame_size as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: max_frame_size,
            });
        }

        let len = len as usize;
        if buf.len() < prefix_len + len {
            return Ok(None);
        }

        buf.advance(prefix_len);
        let payload = buf.split_to(len).freeze();

        Ok(Some(Self { payload }))
    }
}

/// Appends one encoded frame carrying `payload` to `buf`.
///
/// `buf` is left untouched if the payload exceeds `max_frame_size`.
pub fn encode_into(
    payload: &[u8],
    buf: &mut BytesMut,
    max_frame_size: usize,
) -> Result<(), ProtocolError> {
    if payload.len() > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len() as u64,
            max: max_frame_size,
        });
    }

    buf.reserve(varint::encoded_len(payload.len() as u64) + payload.len());
    varint::encode(payload.len() as u64, buf);
    buf.extend_from_slice(payload);
    Ok(())
}

/// Reads frames from a byte stream.
///
/// Bytes are pulled into an internal buffer and frames are cut from it, so
/// [`FrameReader::read_frame`] is cancel safe: dropping the future loses no
/// data and the next call resumes where the previous one stopped.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(DEFAULT_READ_BUFFER_SIZE),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Sets the largest payload this reader accepts.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Returns the number of bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Reads the next frame and returns its payload.
    ///
    /// Fails with `ConnectionClosed` if the stream ends on a frame boundary
    /// and with `FrameRead` (unexpected EOF) if it ends inside a frame.
    pub async fn read_frame(&mut self) -> Result<Bytes, ProtocolError> {
        loop {
            if let Some(frame) = Frame::decode_with_limit(&mut self.buffer, self.max_frame_size)? {
                return Ok(frame.payload);
            }

            if self.buffer.capacity() == self.buffer.len() {
                self.buffer.reserve(DEFAULT_READ_BUFFER_SIZE);
            }

            let n = self
                .inner
                .read_buf(&mut self.buffer)
                .await
                .map_err(ProtocolError::FrameRead)?;

            if n == 0 {
                if self.buffer.is_empty() {
                    return Err(ProtocolError::ConnectionClosed);
                }
                return Err(ProtocolError::FrameRead(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "stream closed inside a frame ({} byte(s) buffered)",
                        self.buffer.len()
                    ),
                )));
            }
        }
    }
}

/// Writes frames to a byte stream.
///
/// Frames are assembled in a scratch buffer and written with a single
/// `write_all`, so a message made of several frames reaches the stream in
/// one piece. Callers must not cancel [`FrameWriter::drain`] once started.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Sets the largest payload this writer sends.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Queues a frame without writing it.
    pub fn feed(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        encode_into(payload, &mut self.buffer, self.max_frame_size)
    }

    /// Drops every queued frame.
    pub fn discard(&mut self) {
        self.buffer.clear();
    }

    /// Returns the number of queued bytes.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Writes one frame and waits until the stream accepted all of it.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.feed(payload)?;
        self.drain().await
    }

    /// Writes every queued frame.
    pub async fn drain(&mut self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let result = self.inner.write_all(&self.buffer).await;
        self.buffer.clear();
        result.map_err(ProtocolError::FrameWrite)
    }

    /// Flushes the underlying stream.
    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        self.inner.flush().await.map_err(ProtocolError::FrameWrite)
    }

    /// Shuts down the write side of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner
            .shutdown()
            .await
            .map_err(ProtocolError::FrameWrite)
    }
}
