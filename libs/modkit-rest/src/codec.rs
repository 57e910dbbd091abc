use crate::error::BoxError;
use bytes::Bytes;
use std::fmt;

/// Wire encoding for structured request bodies and response payloads.
///
/// The invocation core only ever hands the codec `serde_json::Value`s; the
/// declared types are converted to and from that model on either side.
pub trait BodyCodec: fmt::Debug + Send + Sync {
    /// `Content-Type` of bodies produced by [`encode`](Self::encode).
    fn content_type(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns the codec's error if `value` cannot be encoded.
    fn encode(&self, value: &serde_json::Value) -> Result<Bytes, BoxError>;

    /// # Errors
    ///
    /// Returns the codec's error if `bytes` is not a valid document.
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, BoxError>;
}

/// `application/json` via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl BodyCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Bytes, BoxError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, BoxError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
