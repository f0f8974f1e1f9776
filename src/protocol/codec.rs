//! Protocol codec for serialization and deserialization
//!
//! This module handles reading and writing frames on the shared transport.

use super::types::{Command, Frame, FrameHeader, MAX_FRAME_PAYLOAD};
use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use lazy_static::lazy_static;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

lazy_static! {
    /// Encoded size of a [`FrameHeader`]
    pub static ref HEADER_LEN: usize = bincode::serialized_size(&FrameHeader {
        cmd: 0,
        tid: 0,
        len: 0,
    })
    .map(|n| n as usize)
    .unwrap_or(9);
}

/// Read one frame from the stream
///
/// Returns `Ok(None)` when the stream ends on a frame boundary.
pub async fn read_frame<T: AsyncRead + Unpin>(conn: &mut T) -> Result<Option<Frame>> {
    let mut buf = vec![0u8; *HEADER_LEN];
    match conn.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).with_context(|| "Failed to read frame header"),
    }

    let header: FrameHeader =
        bincode::deserialize(&buf).with_context(|| "Failed to deserialize frame header")?;

    let command = match Command::from_byte(header.cmd) {
        Some(cmd) => cmd,
        None => bail!("Unknown frame command: {}", header.cmd),
    };

    let len = header.len as usize;
    if len > MAX_FRAME_PAYLOAD {
        bail!(
            "Frame payload too large: {} bytes (max {})",
            len,
            MAX_FRAME_PAYLOAD
        );
    }

    let mut payload = vec![0u8; len];
    conn.read_exact(&mut payload)
        .await
        .with_context(|| format!("Failed to read {} byte frame payload", len))?;

    trace!("Read {:?} frame for task {} ({} bytes)", command, header.tid, len);

    Ok(Some(Frame::new(command, header.tid, Bytes::from(payload))))
}

/// Write one frame to the stream
pub async fn write_frame<T: AsyncWrite + Unpin>(conn: &mut T, frame: &Frame) -> Result<()> {
    if frame.payload.len() > MAX_FRAME_PAYLOAD {
        bail!("Frame payload too large: {} bytes", frame.payload.len());
    }

    let header =
        bincode::serialize(&frame.header()).with_context(|| "Failed to serialize frame header")?;

    let mut buf = BytesMut::with_capacity(header.len() + frame.payload.len());
    buf.put_slice(&header);
    buf.put_slice(&frame.payload);

    conn.write_all(&buf)
        .await
        .with_context(|| "Failed to write frame")?;
    conn.flush().await.with_context(|| "Failed to flush frame")?;

    trace!(
        "Wrote {:?} frame for task {} ({} bytes)",
        frame.command,
        frame.tid,
        frame.payload.len()
    );
    Ok(())
}
