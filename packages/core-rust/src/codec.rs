//! Canonical binary encoding for values that cross a process boundary.
//!
//! Queue payloads, saga step parameters and cron offsets are all stored as
//! `MsgPack` bytes produced here, so every backend sees the same format.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors from encoding or decoding a value.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encodes a value as named-field `MsgPack`.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the value cannot be serialized.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decodes a value previously produced by [`encode`].
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the bytes do not describe a `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
        sku: String,
        notes: Option<String>,
    }

    #[test]
    fn struct_survives_encoding() {
        let event = OrderPlaced {
            order_id: 7,
            sku: "A-1".to_string(),
            notes: None,
        };
        let bytes = encode(&event).unwrap();
        let back: OrderPlaced = decode(&bytes).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn decoding_garbage_fails() {
        let err = decode::<OrderPlaced>(&[0xc1, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
