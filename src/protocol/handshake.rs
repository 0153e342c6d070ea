//! Connection handshake.
//!
//! The first frame on a persistent connection is a control frame from the client:
//!
//! ```text
//! {"type": "hello", "version": "1.0", "client": "my-agent"}
//! ```
//!
//! The server answers with its version and the registered commands, or rejects:
//!
//! ```text
//! {"type": "welcome", "version": "1.0", "commands": [...], "maxPayloadSize": 16777216}
//! {"type": "reject", "reason": "..."}
//! ```
//!
//! Peers are compatible when their major versions match.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::reader::{write_frame, FrameReader};
use super::{Frame, FrameKind};
use crate::codec::WireCodec;
use crate::error::{Result, WireError};
use crate::handler::CommandInfo;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub version: String,
    #[serde(default)]
    pub commands: Vec<CommandInfo>,
    /// Largest request payload the server accepts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload_size: Option<u32>,
}

impl Welcome {
    pub fn new(commands: Vec<CommandInfo>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            commands,
            max_payload_size: None,
        }
    }

    pub fn with_max_payload_size(mut self, limit: u32) -> Self {
        self.max_payload_size = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Hello(Hello),
    Welcome(Welcome),
    Reject { reason: String },
}

/// Fail unless `peer` has the same major version as [`PROTOCOL_VERSION`].
pub fn check_version(peer: &str) -> Result<()> {
    let major = |v: &str| v.split('.').next().unwrap_or_default().trim().to_string();
    if major(peer).is_empty() || major(peer) != major(PROTOCOL_VERSION) {
        return Err(WireError::Handshake(format!(
            "Incompatible protocol version {} (expected {}.x)",
            peer,
            major(PROTOCOL_VERSION)
        )));
    }
    Ok(())
}

/// Client side: send hello, wait for welcome.
pub async fn client_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    codec: WireCodec,
    client_name: Option<&str>,
) -> Result<Welcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = ControlMessage::Hello(Hello {
        version: PROTOCOL_VERSION.to_string(),
        client: client_name.map(str::to_string),
    });
    write_frame(writer, &Frame::encode(FrameKind::Control, codec, false, &hello)?).await?;

    let frame = reader.next_frame().await?.ok_or(WireError::ConnectionClosed)?;
    if frame.kind() != Some(FrameKind::Control) {
        return Err(WireError::Handshake(format!(
            "Expected control frame, got {:?}",
            frame.kind()
        )));
    }

    match frame.decode::<ControlMessage>()? {
        ControlMessage::Welcome(welcome) => {
            check_version(&welcome.version)?;
            debug!(
                version = %welcome.version,
                commands = welcome.commands.len(),
                "Handshake complete"
            );
            Ok(welcome)
        }
        ControlMessage::Reject { reason } => Err(WireError::Handshake(reason)),
        ControlMessage::Hello(_) => Err(WireError::Handshake(
            "Peer sent hello instead of welcome".to_string(),
        )),
    }
}

/// Server side: wait for hello, answer welcome (or reject and fail).
pub async fn server_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    codec: WireCodec,
    welcome: Welcome,
) -> Result<Hello>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let frame = reader.next_frame().await?.ok_or(WireError::ConnectionClosed)?;
    accept_hello(&frame, writer, codec, welcome).await
}

/// Server side, once the first frame has been read: answer it.
pub async fn accept_hello<W: AsyncWrite + Unpin>(
    frame: &Frame,
    writer: &mut W,
    codec: WireCodec,
    welcome: Welcome,
) -> Result<Hello> {
    let hello = match (frame.kind(), frame.decode::<ControlMessage>()) {
        (Some(FrameKind::Control), Ok(ControlMessage::Hello(hello))) => hello,
        _ => {
            let reason = "Expected hello".to_string();
            reject(writer, codec, &reason).await?;
            return Err(WireError::Handshake(reason));
        }
    };

    if let Err(e) = check_version(&hello.version) {
        reject(writer, codec, &e.to_string()).await?;
        return Err(e);
    }

    let welcome = ControlMessage::Welcome(welcome);
    write_frame(writer, &Frame::encode(FrameKind::Control, codec, true, &welcome)?).await?;

    debug!(client = ?hello.client, version = %hello.version, "Accepted client");
    Ok(hello)
}

async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, codec: WireCodec, reason: &str) -> Result<()> {
    let msg = ControlMessage::Reject {
        reason: reason.to_string(),
    };
    write_frame(writer, &Frame::encode(FrameKind::Control, codec, true, &msg)?).await
}
