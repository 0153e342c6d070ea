//! Codec module - serialization of wire messages.
//!
//! - [`JsonCodec`] - `serde_json`, the default
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`)
//!
//! Codecs are marker structs with static methods. [`WireCodec`] picks one at
//! runtime (from configuration) and is stamped into every frame header, so a
//! receiver always knows how to decode a payload.
//!
//! # Example
//!
//! ```
//! use cmdwire::codec::WireCodec;
//!
//! for codec in [WireCodec::Json, WireCodec::MsgPack] {
//!     let bytes = codec.encode(&vec!["a", "b"]).unwrap();
//!     let back: Vec<String> = codec.decode(&bytes).unwrap();
//!     assert_eq!(back, vec!["a", "b"]);
//! }
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Runtime codec selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireCodec {
    #[default]
    Json,
    #[serde(alias = "messagepack")]
    MsgPack,
}

impl WireCodec {
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            WireCodec::Json => JsonCodec::encode(value),
            WireCodec::MsgPack => MsgPackCodec::encode(value),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            WireCodec::Json => JsonCodec::decode(bytes),
            WireCodec::MsgPack => MsgPackCodec::decode(bytes),
        }
    }
}
