//! Transport abstraction traits.
//!
//! These traits define protocol-agnostic worker communication:
//! - [`WorkerConnection`]: Request/response channel to a calculation worker process
//! - [`Codec`]: Serialization/deserialization abstraction
//!
//! Transport implementations are EXTENSIONS (e.g., TCP, gRPC, message queue).

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::TraitError;
use crate::ids::WorkerId;

// =============================================================================
// WORKER CONNECTION
// =============================================================================

/// Request/response channel to a single remote calculation worker.
///
/// Contract: at most one response per request, correlated by the caller.
#[async_trait]
pub trait WorkerConnection: Send + Sync {
    /// The worker on the other end of the connection.
    fn worker_id(&self) -> &WorkerId;

    /// Send an encoded request and wait for the encoded response.
    async fn round_trip(&self, request: Bytes) -> Result<Bytes, TraitError>;
}

// =============================================================================
// CODEC TRAIT
// =============================================================================

/// Wire format encoding/decoding.
pub trait Codec: Send + Sync {
    /// Encode value to bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, TraitError>;

    /// Decode bytes to value.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, TraitError>;

    /// Get content type header.
    fn content_type(&self) -> &'static str;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, TraitError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| TraitError::SerializationError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, TraitError> {
        serde_json::from_slice(bytes).map_err(|e| TraitError::ParseError(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataValue;

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec;
        let bytes = codec.encode(&DataValue::Double(1.25)).unwrap();
        let value: DataValue = codec.decode(&bytes).unwrap();
        assert_eq!(value, DataValue::Double(1.25));
        assert_eq!(codec.content_type(), "application/json");
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let result: Result<DataValue, _> = JsonCodec.decode(b"not json");
        assert!(matches!(result, Err(TraitError::ParseError(_))));
    }
}
