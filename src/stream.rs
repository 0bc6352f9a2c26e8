//! Pull-based chunk streaming shared by every reader and writer.
//!
//! A [`ChunkSource`] yields one [`ByteChunk`] per request and a [`ChunkSink`]
//! writes one chunk per call. [`pump`] connects the two and never asks the
//! source for more data until the sink has acknowledged the previous chunk,
//! so at most one chunk is in flight between a pair.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One immutable unit of transferred data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteChunk {
    data: Bytes,
    done: bool,
}

impl ByteChunk {
    /// A chunk in the middle of the stream
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            done: false,
        }
    }

    /// The final chunk; it may still carry data that must be written
    pub fn last(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            done: true,
        }
    }

    /// Zero-length end-of-data marker
    pub fn end() -> Self {
        Self::last(Bytes::new())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Producer side of the stream contract
#[async_trait]
pub trait ChunkSource: Send {
    /// Returns the next chunk, a `done` chunk at end of data, or an error.
    /// After [`close`](ChunkSource::close) every call resolves to
    /// [`Error::Cancelled`].
    async fn next_chunk(&mut self) -> Result<ByteChunk>;

    async fn close(&mut self) -> Result<()>;
}

/// Consumer side of the stream contract
#[async_trait]
pub trait ChunkSink: Send {
    /// Writes the chunk and returns how many bytes were consumed. The caller
    /// does not send another chunk until this resolves.
    async fn accept(&mut self, chunk: ByteChunk) -> Result<usize>;

    /// Flushes and releases the underlying handle. Later calls to
    /// [`accept`](ChunkSink::accept) resolve to [`Error::Cancelled`].
    async fn close(&mut self) -> Result<()>;
}

/// How a [`pump`] run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    Finished(u64),
    Cancelled(u64),
}

impl PumpOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            PumpOutcome::Finished(n) | PumpOutcome::Cancelled(n) => *n,
        }
    }
}

/// Moves every chunk from `source` into `sink` in order.
///
/// `on_ack` runs once per acknowledged chunk with the number of bytes the sink
/// consumed. Both ends are closed before this returns, whatever the outcome.
///
/// # Returns
///
/// The bytes moved, as `Finished` at end of stream or `Cancelled` when
/// `cancel_token` fired first.
///
/// # Errors
///
/// The first read or write failure. Nothing after the failing chunk is
/// acknowledged.
pub async fn pump<F>(
    source: &mut dyn ChunkSource,
    sink: &mut dyn ChunkSink,
    cancel_token: &CancellationToken,
    mut on_ack: F,
) -> Result<PumpOutcome>
where
    F: FnMut(usize) + Send,
{
    let mut total: u64 = 0;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("Stream cancelled after {} bytes", total);
                close_both(source, sink).await;
                return Ok(PumpOutcome::Cancelled(total));
            }
            chunk = source.next_chunk() => chunk,
        };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                close_both(source, sink).await;
                return Err(e);
            }
        };

        let done = chunk.is_done();
        if !chunk.is_empty() {
            let accepted = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    info!("Stream cancelled after {} bytes", total);
                    close_both(source, sink).await;
                    return Ok(PumpOutcome::Cancelled(total));
                }
                accepted = sink.accept(chunk) => accepted,
            };
            match accepted {
                Ok(n) => {
                    total += n as u64;
                    on_ack(n);
                }
                Err(e) => {
                    close_both(source, sink).await;
                    return Err(e);
                }
            }
        }

        if done {
            debug!("End of stream reached after {} bytes", total);
            if let Err(e) = source.close().await {
                debug!("Error closing source: {e}");
            }
            sink.close().await?;
            return Ok(PumpOutcome::Finished(total));
        }
    }
}

async fn close_both(source: &mut dyn ChunkSource, sink: &mut dyn ChunkSink) {
    if let Err(e) = source.close().await {
        debug!("Error closing source: {e}");
    }
    if let Err(e) = sink.close().await {
        warn!("Error closing sink: {e}");
    }
}

/// Adapts any `AsyncRead` into a [`ChunkSource`]
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
    io_size: usize,
    eof: bool,
    closed: bool,
}

impl<R> ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, io_size: usize) -> Self {
        Self {
            reader,
            io_size: io_size.max(1),
            eof: false,
            closed: false,
        }
    }
}

#[async_trait]
impl<R> ChunkSource for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_chunk(&mut self) -> Result<ByteChunk> {
        if self.closed {
            return Err(Error::Cancelled);
        }
        if self.eof {
            return Ok(ByteChunk::end());
        }
        let mut buffer = BytesMut::with_capacity(self.io_size);
        match self.reader.read_buf(&mut buffer).await {
            Ok(0) => {
                self.eof = true;
                Ok(ByteChunk::end())
            }
            Ok(_) => Ok(ByteChunk::data(buffer.freeze())),
            Err(e) => Err(Error::ReadFailure(e.to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Adapts any `AsyncWrite` into a [`ChunkSink`]
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
    closed: bool,
}

impl<W> WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> ChunkSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn accept(&mut self, chunk: ByteChunk) -> Result<usize> {
        if self.closed {
            return Err(Error::Cancelled);
        }
        let data = chunk.into_bytes();
        self.writer
            .write_all(&data)
            .await
            .map_err(|e| Error::WriteFailure(e.to_string()))?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer
            .shutdown()
            .await
            .map_err(|e| Error::WriteFailure(e.to_string()))
    }
}
