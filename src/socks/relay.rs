//! Bidirectional relay between a client and its peer
//!
//! Each direction is a pump that reads one chunk, writes it fully, then reads
//! the next, so a slow destination pauses its source instead of buffering.
//! The two pumps share a cancellation token: whichever ends first (EOF or
//! error) cancels the other's pending read, and each pump finishes its own
//! destination gracefully once its in-flight write is done.

use super::consts::DEFAULT_BUFFER_SIZE;
use crate::broker::{TaskReceiver, TaskSender};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Source side of one relay direction
#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk, `None` at end of stream
    ///
    /// Must be cancel safe: a cancelled call loses no data.
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>>;
}

/// Destination side of one relay direction
#[async_trait]
pub trait ChunkSink: Send {
    /// Deliver one chunk, returning once it has been accepted downstream
    async fn send_chunk(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Signal end of stream to the destination
    async fn finish(&mut self) -> io::Result<()>;
}

/// [`ChunkSource`] over a byte stream
pub struct StreamSource<R> {
    reader: R,
    buf: BytesMut,
}

impl<R> StreamSource<R> {
    /// Wrap a reader
    pub fn new(reader: R) -> Self {
        StreamSource {
            reader,
            buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ChunkSource for StreamSource<R> {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.buf.reserve(DEFAULT_BUFFER_SIZE);
        let n = self.reader.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }
}

/// [`ChunkSink`] over a byte stream
pub struct StreamSink<W> {
    writer: W,
}

impl<W> StreamSink<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        StreamSink { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChunkSink for StreamSink<W> {
    async fn send_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.writer.write_all(&chunk).await?;
        self.writer.flush().await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

#[async_trait]
impl ChunkSource for TaskReceiver {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.recv().await)
    }
}

#[async_trait]
impl ChunkSink for TaskSender {
    async fn send_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.send(chunk)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.close().await;
        Ok(())
    }
}

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to peer
    pub client_to_peer: u64,
    /// Peer to client
    pub peer_to_client: u64,
}

/// Relay until either side ends
///
/// `pipelined` holds client bytes that arrived before relaying started; they
/// are sent to the peer first. Both destinations are finished before this
/// returns. The first I/O error of either direction is returned.
pub async fn relay<CR, CW, PR, PW>(
    mut client_rx: CR,
    mut client_tx: CW,
    mut peer_rx: PR,
    mut peer_tx: PW,
    pipelined: Bytes,
) -> io::Result<RelayStats>
where
    CR: ChunkSource,
    CW: ChunkSink,
    PR: ChunkSource,
    PW: ChunkSink,
{
    let cancel = CancellationToken::new();

    let (upstream, downstream) = tokio::join!(
        pump(
            "client->peer",
            &mut client_rx,
            &mut peer_tx,
            pipelined,
            &cancel
        ),
        pump(
            "peer->client",
            &mut peer_rx,
            &mut client_tx,
            Bytes::new(),
            &cancel
        ),
    );

    let stats = RelayStats {
        client_to_peer: *upstream.as_ref().unwrap_or(&0),
        peer_to_client: *downstream.as_ref().unwrap_or(&0),
    };
    upstream?;
    downstream?;
    Ok(stats)
}

/// Copy one direction, then cancel the other and finish the destination
async fn pump<S, D>(
    direction: &'static str,
    source: &mut S,
    sink: &mut D,
    first: Bytes,
    cancel: &CancellationToken,
) -> io::Result<u64>
where
    S: ChunkSource + ?Sized,
    D: ChunkSink + ?Sized,
{
    let mut total = 0u64;
    let result = copy_chunks(source, sink, first, cancel, &mut total).await;

    cancel.cancel();
    if let Err(e) = sink.finish().await {
        debug!("{} finish failed: {}", direction, e);
    }

    match &result {
        Ok(()) => trace!("{} done: {} bytes", direction, total),
        Err(e) => debug!("{} error after {} bytes: {}", direction, total, e),
    }
    result.map(|_| total)
}

async fn copy_chunks<S, D>(
    source: &mut S,
    sink: &mut D,
    first: Bytes,
    cancel: &CancellationToken,
    total: &mut u64,
) -> io::Result<()>
where
    S: ChunkSource + ?Sized,
    D: ChunkSink + ?Sized,
{
    if !first.is_empty() {
        let len = first.len() as u64;
        sink.send_chunk(first).await?;
        *total += len;
    }

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            chunk = source.next_chunk() => chunk?,
        };

        match chunk {
            Some(chunk) => {
                let len = chunk.len() as u64;
                sink.send_chunk(chunk).await?;
                *total += len;
            }
            None => return Ok(()),
        }
    }
}
