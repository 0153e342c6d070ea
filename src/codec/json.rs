//! JSON codec using `serde_json`.
//!
//! The default wire encoding: readable in logs and accepted by any peer.

use crate::error::Result;

/// JSON codec for wire messages.
pub struct JsonCodec;

impl JsonCodec {
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
