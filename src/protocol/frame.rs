//! Frame structure and construction.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::wire_format::{FrameKind, Header, HEADER_SIZE};
use crate::codec::WireCodec;
use crate::error::{Result, WireError};

/// A complete frame: header plus payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Encode `message` with `codec` into a frame of the given kind.
    pub fn encode<T: Serialize>(
        kind: FrameKind,
        codec: WireCodec,
        from_server: bool,
        message: &T,
    ) -> Result<Self> {
        let payload = codec.encode(message)?;
        let length = u32::try_from(payload.len()).map_err(|_| {
            WireError::Protocol(format!("Payload of {} bytes is too large", payload.len()))
        })?;
        Ok(Self {
            header: Header::compose(kind, codec, from_server, length),
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload with the codec named in the header.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.header.codec().decode(&self.payload)
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn kind(&self) -> Option<FrameKind> {
        self.header.kind()
    }

    #[inline]
    pub fn codec(&self) -> WireCodec {
        self.header.codec()
    }

    /// Header and payload as one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        build_frame(&self.header, &self.payload)
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use cmdwire::protocol::{build_frame, Header, HEADER_SIZE};
///
/// let header = Header::new(0, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_encode_sets_header() {
        let frame = Frame::encode(FrameKind::Event, WireCodec::Json, true, &json!({"a": 1})).unwrap();
        assert_eq!(frame.kind(), Some(FrameKind::Event));
        assert_eq!(frame.codec(), WireCodec::Json);
        assert_eq!(frame.header.payload_length as usize, frame.payload_len());
        assert_eq!(frame.payload(), br#"{"a":1}"#);
    }

    #[test]
    fn test_decode_uses_header_codec() {
        for codec in [WireCodec::Json, WireCodec::MsgPack] {
            let frame = Frame::encode(FrameKind::Request, codec, false, &json!([1, "x"])).unwrap();
            let value: Value = frame.decode().unwrap();
            assert_eq!(value, json!([1, "x"]));
        }
    }

    #[test]
    fn test_to_bytes_layout() {
        let frame = Frame::new(Header::new(0x04, 3), Bytes::from_static(b"abc"));
        assert_eq!(frame.to_bytes(), vec![0x04, 0, 0, 0, 3, b'a', b'b', b'c']);
    }
}
