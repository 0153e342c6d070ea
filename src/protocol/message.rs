//! Wire messages.
//!
//! Request (client to server, [`FrameKind::Request`](super::FrameKind::Request)):
//!
//! ```text
//! {"id": 1, "method": "execute", "params": {"name": "echo", "input": {...}}}
//! {"id": 2, "method": "batch",   "params": {"items": [...], "options": {...}}}
//! {"id": 1, "method": "cancel",  "params": {"reason": "..."}}
//! ```
//!
//! Reply: `{"id": 1, "result": <ResultEnvelope | BatchResult>}` or, for failures
//! of the transport itself, `{"id": 1, "error": {"code": "...", "message": "..."}}`.
//!
//! Chunk: `{"id": 1, "seq": 0, "chunk": <StreamChunk>}`. Event: `{"event": "...",
//! "data": ...}`; events carry no id and never answer a request.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::batch::{BatchItem, BatchOptions};
use crate::codec::WireCodec;
use crate::envelope::{codes, CommandError};
use crate::stream::StreamChunk;

/// Fault code for a request the server could not parse.
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
/// Fault code for a request refused because the server is at capacity.
pub const SERVER_BUSY: &str = "SERVER_BUSY";

/// Request id: a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Num(u64),
    Str(String),
}

impl fmt::Display for WireId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireId::Num(n) => write!(f, "{}", n),
            WireId::Str(s) => f.write_str(s),
        }
    }
}

impl From<u64> for WireId {
    fn from(n: u64) -> Self {
        WireId::Num(n)
    }
}

impl From<String> for WireId {
    fn from(s: String) -> Self {
        WireId::Str(s)
    }
}

impl From<&str> for WireId {
    fn from(s: &str) -> Self {
        WireId::Str(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    pub name: String,
    #[serde(default)]
    pub input: Value,
    /// Ask for chunked output instead of a single reply.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchParams {
    pub items: Vec<BatchItem>,
    #[serde(default)]
    pub options: BatchOptions,
}

/// Cancels the request carrying the same id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum WireCall {
    Execute(ExecuteParams),
    Batch(BatchParams),
    Cancel(CancelParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: WireId,
    #[serde(flatten)]
    pub call: WireCall,
}

impl WireRequest {
    pub fn execute(id: impl Into<WireId>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            call: WireCall::Execute(ExecuteParams {
                name: name.into(),
                input,
                stream: false,
                trace_id: None,
            }),
        }
    }

    pub fn batch(id: impl Into<WireId>, items: Vec<BatchItem>, options: BatchOptions) -> Self {
        Self {
            id: id.into(),
            call: WireCall::Batch(BatchParams { items, options }),
        }
    }

    pub fn cancel(id: impl Into<WireId>, reason: Option<String>) -> Self {
        Self {
            id: id.into(),
            call: WireCall::Cancel(CancelParams { reason }),
        }
    }
}

/// Best-effort id extraction from a request or reply that failed to decode fully.
pub fn peek_id(codec: WireCodec, payload: &[u8]) -> Option<WireId> {
    #[derive(Deserialize)]
    struct IdOnly {
        id: WireId,
    }
    codec.decode::<IdOnly>(payload).ok().map(|p| p.id)
}

/// Failure of the transport itself, as opposed to a handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportFault {
    pub code: String,
    pub message: String,
}

impl TransportFault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Envelope error for the caller.
    ///
    /// `TIMEOUT` and `CANCELLED` keep their code; everything else becomes
    /// `INTERNAL_ERROR` with the original code in `details.faultCode`.
    pub fn into_command_error(self) -> CommandError {
        match self.code.as_str() {
            codes::TIMEOUT | codes::CANCELLED => {
                CommandError::new(self.code, self.message).with_retryable(true)
            }
            _ => {
                let retryable = self.code == SERVER_BUSY;
                CommandError::internal(format!("Transport failure: {}", self.message))
                    .with_retryable(retryable)
                    .with_detail("faultCode", json!(self.code))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireReply {
    pub id: WireId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransportFault>,
}

impl WireReply {
    pub fn result<T: Serialize>(id: WireId, result: &T) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self {
                id,
                result: Some(value),
                error: None,
            },
            Err(e) => Self::fault(
                id,
                TransportFault::new(codes::INTERNAL_ERROR, format!("Unserializable result: {}", e)),
            ),
        }
    }

    pub fn fault(id: WireId, fault: TransportFault) -> Self {
        Self {
            id,
            result: None,
            error: Some(fault),
        }
    }

    /// Decode the result into `T`.
    ///
    /// Faults and malformed replies both come back as a [`CommandError`].
    pub fn into_outcome<T: DeserializeOwned>(self) -> Result<T, CommandError> {
        match (self.result, self.error) {
            (_, Some(fault)) => Err(fault.into_command_error()),
            (Some(value), None) => serde_json::from_value(value).map_err(|e| {
                CommandError::internal(format!("Malformed reply: {}", e))
            }),
            (None, None) => Err(CommandError::internal(
                "Malformed reply: neither result nor error",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChunk {
    pub id: WireId,
    pub seq: u64,
    pub chunk: StreamChunk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
