//! Structured encoding for headers and call payloads.

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializes call headers and payloads.
///
/// The framing layer never looks inside payload bytes; it only needs a way
/// to turn typed values into bytes and back. The same codec is used for the
/// header record, so both ends of a connection must agree on it.
pub trait PayloadCodec: Clone + Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError>;
}

/// JSON payloads via `serde_json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(|e| ProtocolError::PayloadEncode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::PayloadDecode(e.to_string()))
    }
}
