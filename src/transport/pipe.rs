//! Unix domain socket plumbing.
//!
//! - [`PipeListener`] / [`PipeStream`]: server side, served by
//!   [`Server::serve_listener`](crate::Server::serve_listener)
//! - [`UnixConnector`]: persistent connections for a [`StreamingTransport`](super::StreamingTransport)
//! - [`UnixRequestChannel`]: one short-lived connection per request for a
//!   [`RequestTransport`](super::RequestTransport)
//!
//! # Example
//!
//! ```ignore
//! use cmdwire::transport::{generate_pipe_path, PipeListener, UnixConnector};
//!
//! let path = generate_pipe_path();
//! let listener = PipeListener::bind(&path).await?;
//! tokio::spawn(server.serve_listener(listener));
//!
//! let client = Client::builder().streaming(UnixConnector::new(&path));
//! ```

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use super::request::RequestChannel;
use super::streaming::{Connector, DuplexStream};
use crate::error::{Result, WireError};
use crate::protocol::{write_frame, Frame, FrameReader};

/// Unique socket path in the temp directory:
/// `{tmp}/cmdwire-{pid}-{random}.sock`.
pub fn generate_pipe_path() -> String {
    let name = format!("cmdwire-{}-{:x}.sock", std::process::id(), rand_u64());
    std::env::temp_dir().join(name).to_string_lossy().into_owned()
}

/// Time, pid and a process-wide counter, mixed.
fn rand_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = u64::from(std::process::id());
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);

    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid ^ n.rotate_left(32)
}

/// Unix socket listener. Removes its socket file when dropped.
pub struct PipeListener {
    listener: UnixListener,
    path: String,
}

impl PipeListener {
    /// Bind to `path`, replacing a stale socket file.
    pub async fn bind(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        debug!(path = %path, "Listening");

        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }

    pub async fn accept(&self) -> Result<PipeStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(PipeStream { stream })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Accepted connection.
pub struct PipeStream {
    stream: UnixStream,
}

impl PipeStream {
    pub fn inner(&self) -> &UnixStream {
        &self.stream
    }

    pub fn into_inner(self) -> UnixStream {
        self.stream
    }
}

impl AsyncRead for PipeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Opens persistent connections to a socket path.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> Result<Box<dyn DuplexStream>> {
        let stream = UnixStream::connect(&self.path).await?;
        Ok(Box::new(stream))
    }
}

/// Sends each request over its own connection to a socket path.
#[derive(Debug, Clone)]
pub struct UnixRequestChannel {
    path: PathBuf,
}

impl UnixRequestChannel {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl RequestChannel for UnixRequestChannel {
    async fn round_trip(&self, request: Frame) -> Result<Frame> {
        let stream = UnixStream::connect(&self.path).await?;
        let (read_half, mut write_half) = stream.into_split();

        write_frame(&mut write_half, &request).await?;

        let mut reader = FrameReader::new(read_half);
        reader.next_frame().await?.ok_or(WireError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireCodec;
    use crate::protocol::FrameKind;
    use serde_json::{json, Value};

    #[test]
    fn test_generate_pipe_path_format() {
        let path = generate_pipe_path();
        let pid = std::process::id().to_string();
        assert!(path.ends_with(".sock"));
        assert!(path.contains(&format!("cmdwire-{}-", pid)));
    }

    #[test]
    fn test_generate_pipe_path_uniqueness() {
        let paths: std::collections::HashSet<String> =
            (0..10).map(|_| generate_pipe_path()).collect();
        assert_eq!(paths.len(), 10);
    }

    #[tokio::test]
    async fn test_listener_removes_socket_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop.sock");
        let path = path.to_str().unwrap();

        let listener = PipeListener::bind(path).await.unwrap();
        assert!(Path::new(path).exists());
        drop(listener);
        assert!(!Path::new(path).exists());
    }

    #[tokio::test]
    async fn test_request_channel_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rt.sock");
        let listener = PipeListener::bind(path.to_str().unwrap()).await.unwrap();

        // Echo peer: answers each request frame with its own payload.
        tokio::spawn(async move {
            let stream = listener.accept().await.unwrap().into_inner();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half);
            let frame = reader.next_frame().await.unwrap().unwrap();
            let value: Value = frame.decode().unwrap();
            let reply = Frame::encode(FrameKind::Reply, WireCodec::Json, true, &value).unwrap();
            write_frame(&mut write_half, &reply).await.unwrap();
        });

        let channel = UnixRequestChannel::new(&path);
        let request = Frame::encode(FrameKind::Request, WireCodec::Json, false, &json!([1, 2])).unwrap();
        let reply = channel.round_trip(request).await.unwrap();

        assert_eq!(reply.kind(), Some(FrameKind::Reply));
        assert_eq!(reply.decode::<Value>().unwrap(), json!([1, 2]));
    }
}
