//! Duplex channel to the worker.
//!
//! Requests go out on the inbound pipe, replies come back on the outbound
//! pipe. Neither direction has framing of its own: requests are terminated by
//! a newline, replies are delimited by the JSON grammar (see [`ResyncCodec`]).

use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::codec::ResyncCodec;

/// Largest reply accepted before a partial value is abandoned.
pub const DEFAULT_MAX_REPLY_BYTES: usize = 16 * 1024 * 1024;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;
type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to write request to worker: {0}")]
    Write(#[source] io::Error),

    #[error("failed to read reply from worker: {0}")]
    Read(#[from] io::Error),

    #[error("reply pipe closed before a complete JSON value arrived")]
    UnexpectedEof,

    #[error("reply exceeded {limit} bytes without completing")]
    ReplyTooLarge { limit: usize },

    #[error("undecodable reply: {0}")]
    Backend(#[source] serde_json::Error),
}

/// Append the request terminator unless the payload already ends with one.
pub fn terminate(payload: Bytes) -> Bytes {
    if payload.last() == Some(&b'\n') {
        return payload;
    }
    let mut framed = BytesMut::with_capacity(payload.len() + 1);
    framed.extend_from_slice(&payload);
    framed.extend_from_slice(b"\n");
    framed.freeze()
}

/// Buffered read cursor over the reply pipe.
///
/// The buffer outlives individual reads: bytes that arrive after a reply stay
/// here for the next call and are never read twice.
pub struct ReplyReader {
    inner: BoxedReader,
    buf: BytesMut,
    codec: ResyncCodec,
}

impl ReplyReader {
    pub fn new<R>(inner: R, max_reply_bytes: usize) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            inner: Box::pin(inner),
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            codec: ResyncCodec::new(max_reply_bytes),
        }
    }

    /// Read the next complete JSON value.
    ///
    /// Returns `Err(ChannelError::UnexpectedEof)` when the pipe reaches EOF
    /// before a value completes.
    pub async fn read_reply(&mut self) -> Result<Bytes, ChannelError> {
        loop {
            if let Some(reply) = self.codec.decode(&mut self.buf)? {
                return Ok(reply);
            }

            self.buf.reserve(READ_CHUNK_SIZE);
            let read = self.inner.read_buf(&mut self.buf).await?;

            if read == 0 {
                return match self.codec.decode_eof(&mut self.buf)? {
                    Some(reply) => Ok(reply),
                    None => Err(ChannelError::UnexpectedEof),
                };
            }
        }
    }

    /// Bytes read from the pipe but not yet returned as a reply.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes discarded so far while resynchronizing.
    pub fn skipped(&self) -> u64 {
        self.codec.skipped()
    }
}

/// The worker's request sink and reply source, owned as one resource.
///
/// Has no synchronization of its own; callers must hold exclusive access for
/// the whole write-then-read span (see [`crate::BridgeService`]).
pub struct DuplexChannel {
    writer: BoxedWriter,
    reader: ReplyReader,
}

impl DuplexChannel {
    pub fn new<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + 'static,
        R: AsyncRead + Send + 'static,
    {
        Self {
            writer: Box::pin(writer),
            reader: ReplyReader::new(reader, DEFAULT_MAX_REPLY_BYTES),
        }
    }

    /// Replace the reply size cap. Any buffered reply bytes are kept.
    pub fn with_max_reply_bytes(mut self, max_reply_bytes: usize) -> Self {
        self.reader.codec = ResyncCodec::new(max_reply_bytes);
        self
    }

    /// Write one request, newline-terminated, and flush it to the worker.
    pub async fn write_request(&mut self, payload: Bytes) -> Result<usize, ChannelError> {
        let request = terminate(payload);
        self.writer
            .write_all(&request)
            .await
            .map_err(ChannelError::Write)?;
        self.writer.flush().await.map_err(ChannelError::Write)?;
        tracing::trace!(request_bytes = request.len(), "Request written");
        Ok(request.len())
    }

    pub async fn read_reply(&mut self) -> Result<Bytes, ChannelError> {
        self.reader.read_reply().await
    }

    /// Write a request and read the one reply that answers it.
    ///
    /// No read is attempted when the write fails, so a reply that never comes
    /// is not waited for.
    pub async fn round_trip(&mut self, payload: Bytes) -> Result<Bytes, ChannelError> {
        self.write_request(payload).await?;
        self.read_reply().await
    }

    pub fn reader(&self) -> &ReplyReader {
        &self.reader
    }

    /// Shut down the request side. The handles themselves close on drop.
    pub async fn close(&mut self) -> Result<(), ChannelError> {
        self.writer.shutdown().await.map_err(ChannelError::Write)
    }
}
