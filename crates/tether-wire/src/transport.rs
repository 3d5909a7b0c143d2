//! Transports: the channels an endpoint speaks over.
//!
//! A [`Transport`] splits into a [`FrameSink`] and a [`FrameSource`]; the
//! endpoint's writer task owns the sink and its reader task owns the source.
//! Two implementations ship here: an in-process [`MemoryTransport`] pair and a
//! length-framed [`StreamTransport`] over any async byte stream.

use crate::message::{decode_length, encode_frame, Frame};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: Frame) -> Result<(), WireError>;
}

/// Inbound half of a transport. `Ok(None)` means the peer closed cleanly.
#[async_trait]
pub trait FrameSource: Send + 'static {
    async fn recv(&mut self) -> Result<Option<Frame>, WireError>;
}

/// A bidirectional channel that can be split between a reader and a writer.
pub trait Transport: Send + 'static {
    fn into_split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>);
}

// ---------------------------------------------------------------------------
// In-process transport
// ---------------------------------------------------------------------------

/// One end of an in-process channel. Frames (and transfer buffers) are moved,
/// never serialized.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryTransport {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

struct MemorySink(mpsc::UnboundedSender<Frame>);

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), WireError> {
        self.0.send(frame).map_err(|_| WireError::ConnectionClosed)
    }
}

struct MemorySource(mpsc::UnboundedReceiver<Frame>);

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Frame>, WireError> {
        Ok(self.0.recv().await)
    }
}

impl Transport for MemoryTransport {
    fn into_split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (Box::new(MemorySink(self.tx)), Box::new(MemorySource(self.rx)))
    }
}

// ---------------------------------------------------------------------------
// Byte-stream transport
// ---------------------------------------------------------------------------

/// Length-framed JSON over an async reader/writer pair.
pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
    max_frame_bytes: u32,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Frames larger than `max_frame_bytes`, transfer buffers included, are rejected.
    pub fn new(reader: R, writer: W, max_frame_bytes: u32) -> Self {
        Self {
            reader,
            writer,
            max_frame_bytes,
        }
    }
}

impl StreamTransport<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf> {
    /// Split a TCP stream into owned halves.
    pub fn tcp(stream: TcpStream, max_frame_bytes: u32) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, max_frame_bytes)
    }
}

impl<S> StreamTransport<tokio::io::ReadHalf<S>, tokio::io::WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap any duplex stream (pipes, `tokio::io::duplex`, TLS streams).
    pub fn from_stream(stream: S, max_frame_bytes: u32) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, max_frame_bytes)
    }
}

struct StreamSink<W>(W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> FrameSink for StreamSink<W> {
    async fn send(&mut self, frame: Frame) -> Result<(), WireError> {
        write_frame(&mut self.0, &frame).await
    }
}

struct StreamSource<R> {
    reader: R,
    max_frame_bytes: u32,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> FrameSource for StreamSource<R> {
    async fn recv(&mut self) -> Result<Option<Frame>, WireError> {
        read_frame(&mut self.reader, self.max_frame_bytes).await
    }
}

impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn into_split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (
            Box::new(StreamSink(self.writer)),
            Box::new(StreamSource {
                reader: self.reader,
                max_frame_bytes: self.max_frame_bytes,
            }),
        )
    }
}

/// Write one encoded frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), WireError> {
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end-of-stream between frames.
///
/// `max_frame_bytes` bounds the whole frame: the JSON body plus every transfer
/// buffer and its length prefix.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Option<Frame>, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireError::Io(e)),
    }

    let mut budget = FrameBudget::new(max_frame_bytes);
    let body = read_chunk(reader, decode_length(&header), &mut budget).await?;
    let body: serde_json::Value = serde_json::from_slice(&body)?;

    reader.read_exact(&mut header).await?;
    let count = decode_length(&header);
    budget.charge(count.saturating_mul(4))?;

    let mut transfer = Vec::new();
    for _ in 0..count {
        reader.read_exact(&mut header).await?;
        let chunk = read_chunk(reader, decode_length(&header), &mut budget).await?;
        transfer.push(Bytes::from(chunk));
    }

    Ok(Some(Frame { body, transfer }))
}

/// Running size of the frame being read, checked against the limit.
struct FrameBudget {
    used: u32,
    max: u32,
}

impl FrameBudget {
    fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    fn charge(&mut self, bytes: u32) -> Result<(), WireError> {
        let size = self.used.saturating_add(bytes);
        if size > self.max {
            return Err(WireError::MessageTooLarge {
                size,
                max: self.max,
            });
        }
        self.used = size;
        Ok(())
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u32,
    budget: &mut FrameBudget,
) -> Result<Vec<u8>, WireError> {
    budget.charge(len)?;
    let mut chunk = vec![0u8; len as usize];
    reader.read_exact(&mut chunk).await?;
    Ok(chunk)
}
