//! Payload codecs for persisted cart state
//!
//! A codec turns a serialized payload into a storage-safe string and back.
//! The only contract is `decode(encode(x)) == x`; the algorithm behind it is
//! an implementation choice.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{CartError, CartResult};

/// Reversible transform between raw payload bytes and a storage-safe string.
pub trait Codec: Send + Sync {
    fn encode(&self, data: &[u8]) -> CartResult<String>;
    fn decode(&self, text: &str) -> CartResult<Vec<u8>>;
}

/// Identity codec: the payload is stored as UTF-8 text unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl Codec for PlainCodec {
    fn encode(&self, data: &[u8]) -> CartResult<String> {
        String::from_utf8(data.to_vec())
            .map_err(|e| CartError::Codec(format!("Payload is not valid UTF-8: {}", e)))
    }

    fn decode(&self, text: &str) -> CartResult<Vec<u8>> {
        Ok(text.as_bytes().to_vec())
    }
}

/// zstd-compressed, base64-armored codec.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Codec for ZstdCodec {
    fn encode(&self, data: &[u8]) -> CartResult<String> {
        let compressed = zstd::encode_all(data, self.level)
            .map_err(|e| CartError::Codec(format!("Compression failed: {}", e)))?;
        Ok(STANDARD.encode(compressed))
    }

    fn decode(&self, text: &str) -> CartResult<Vec<u8>> {
        let compressed = STANDARD
            .decode(text)
            .map_err(|e| CartError::Codec(format!("Invalid base64 payload: {}", e)))?;
        zstd::decode_all(compressed.as_slice())
            .map_err(|e| CartError::Codec(format!("Decompression failed: {}", e)))
    }
}
