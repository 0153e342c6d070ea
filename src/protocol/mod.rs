//! Protocol module - framing and wire messages.
//!
//! Every message on a socket travels in a frame:
//!
//! ```text
//! +-------+----------------+------------------+
//! | Flags | Payload Length | Payload          |
//! | 1 B   | 4 B (BE u32)   | N bytes          |
//! +-------+----------------+------------------+
//! ```
//!
//! The flags name the payload codec and the frame kind (request, reply, chunk,
//! event, control). See [`wire_format`] for the bit layout and [`message`] for the
//! payloads.

mod frame;
mod frame_buffer;
pub mod handshake;
pub mod message;
mod reader;
pub mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use handshake::{ControlMessage, Hello, Welcome, PROTOCOL_VERSION};
pub use message::{
    peek_id, BatchParams, CancelParams, ExecuteParams, TransportFault, WireCall, WireChunk,
    WireEvent, WireId, WireReply, WireRequest,
};
pub use reader::{write_frame, FrameReader};
pub use wire_format::{flags, FrameKind, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
