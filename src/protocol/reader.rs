//! Frame-level reading and writing over async byte streams.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Frame, FrameBuffer};
use crate::error::Result;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Reads whole frames from a byte stream.
pub struct FrameReader<R> {
    reader: R,
    frames: FrameBuffer,
    ready: VecDeque<Frame>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_buffer(reader, FrameBuffer::new())
    }

    pub fn with_buffer(reader: R, frames: FrameBuffer) -> Self {
        Self {
            reader,
            frames,
            ready: VecDeque::new(),
            buf: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    /// Next complete frame, or `None` once the peer closed the stream.
    ///
    /// Bytes of a partial frame left at end-of-stream are discarded.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.ready.extend(self.frames.push(&self.buf[..n])?);
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer.write_all(&frame.header.encode()).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}
