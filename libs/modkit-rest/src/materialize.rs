//! Turns a terminal response into the method's declared result or its
//! declared exception.

use crate::codec::{BodyCodec, JsonCodec};
use crate::descriptor::{MethodDescriptor, ReturnShape, ValueType};
use crate::error::RestError;
use crate::exception::{ErrorParts, ExceptionRegistry};
use crate::response::{ResponseDescriptor, ResponseStream};
use bytes::Bytes;
use http::{Method, StatusCode};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Bytes read off a discarded 404 body.
const DISCARD_LIMIT: usize = 64 * 1024;

/// Result of a successful call, shaped by the method's return type.
pub enum Output {
    /// No value: void methods, empty payloads and the GET 404 case
    None,
    /// Payload decoded into the declared type
    Value(Box<dyn Any + Send + Sync>),
    /// HEAD request outcome
    Bool(bool),
    /// Whole payload
    Bytes(Bytes),
    /// Live payload, owned by the caller
    Stream(ResponseStream),
}

impl Output {
    fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Value(_) => "value",
            Self::Bool(_) => "bool",
            Self::Bytes(_) => "bytes",
            Self::Stream(_) => "stream",
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Take the decoded value.
    ///
    /// # Errors
    ///
    /// Returns `RestError::OutputMismatch` if the output holds no value of
    /// type `T`.
    pub fn into_value<T: Any>(self) -> Result<T, RestError> {
        match self {
            Self::Value(value) => value.downcast::<T>().map(|v| *v).map_err(|_| {
                RestError::OutputMismatch {
                    expected: std::any::type_name::<T>(),
                    actual: "value of another type",
                }
            }),
            other => Err(mismatch(std::any::type_name::<T>(), &other)),
        }
    }

    /// Take the decoded value, mapping [`Output::None`] to `None`.
    ///
    /// # Errors
    ///
    /// Same as [`into_value`](Self::into_value).
    pub fn into_option<T: Any>(self) -> Result<Option<T>, RestError> {
        if self.is_none() {
            return Ok(None);
        }
        self.into_value().map(Some)
    }

    /// # Errors
    ///
    /// Returns `RestError::OutputMismatch` unless the output is a boolean.
    pub fn into_bool(self) -> Result<bool, RestError> {
        match self {
            Self::Bool(value) => Ok(value),
            other => Err(mismatch("bool", &other)),
        }
    }

    /// # Errors
    ///
    /// Returns `RestError::OutputMismatch` unless the output is bytes.
    pub fn into_bytes(self) -> Result<Bytes, RestError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            other => Err(mismatch("bytes", &other)),
        }
    }

    /// # Errors
    ///
    /// Returns `RestError::OutputMismatch` unless the output is a stream.
    pub fn into_stream(self) -> Result<ResponseStream, RestError> {
        match self {
            Self::Stream(stream) => Ok(stream),
            other => Err(mismatch("stream", &other)),
        }
    }
}

fn mismatch(expected: &'static str, actual: &Output) -> RestError {
    RestError::OutputMismatch {
        expected,
        actual: actual.kind(),
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// Maps responses to outputs or typed exceptions.
#[derive(Debug, Clone)]
pub struct Materializer {
    codec: Arc<dyn BodyCodec>,
    exceptions: Arc<ExceptionRegistry>,
}

impl Default for Materializer {
    fn default() -> Self {
        Self::new(Arc::new(JsonCodec), Arc::new(ExceptionRegistry::with_defaults()))
    }
}

impl Materializer {
    #[must_use]
    pub fn new(codec: Arc<dyn BodyCodec>, exceptions: Arc<ExceptionRegistry>) -> Self {
        Self { codec, exceptions }
    }

    /// Materialize `response` for `descriptor`.
    ///
    /// A GET answered with a 404 the method does not expect yields
    /// [`Output::None`] instead of an error.
    ///
    /// # Errors
    ///
    /// - `RestError::UnexpectedStatus` carrying the declared exception for
    ///   any other unexpected status
    /// - `RestError::ExceptionConstruction` if that exception cannot be built
    /// - `RestError::Serialization` if the payload does not decode
    /// - `RestError::BodyTooLarge` / `RestError::Transport` while reading
    pub async fn materialize(
        &self,
        response: ResponseDescriptor,
        descriptor: &MethodDescriptor,
    ) -> Result<Output, RestError> {
        let status = response.status();

        if !descriptor.expected().contains(status) {
            if *descriptor.method() == Method::GET && status == StatusCode::NOT_FOUND {
                tracing::debug!(method = descriptor.name(), "GET returned 404; materializing as absent");
                response.discard(DISCARD_LIMIT).await;
                return Ok(Output::None);
            }
            return Err(self.exception(response, descriptor).await);
        }

        match descriptor.shape() {
            ReturnShape::Void => {
                drop(response);
                Ok(Output::None)
            }
            ReturnShape::Stream => Ok(Output::Stream(response.into_stream())),
            ReturnShape::HeadStatus => Ok(Output::Bool(status.is_success())),
            ReturnShape::Bytes => Ok(Output::Bytes(response.bytes().await?)),
            ReturnShape::Value(ty) => {
                let body = response.bytes().await?;
                if body.is_empty() {
                    return Ok(Output::None);
                }
                self.decode(&body, *ty).map(Output::Value)
            }
        }
    }

    fn decode(&self, body: &[u8], ty: ValueType) -> Result<Box<dyn Any + Send + Sync>, RestError> {
        let value = self
            .codec
            .decode(body)
            .map_err(|e| RestError::serialization(ty.name(), e))?;
        ty.decode(value).map_err(|e| RestError::serialization(ty.name(), e))
    }

    async fn exception(&self, response: ResponseDescriptor, descriptor: &MethodDescriptor) -> RestError {
        let status = response.status();
        let headers = response.headers().clone();
        // oversized error payloads still produce the typed error
        let raw_body = match response.text_truncated().await {
            Ok(text) => text,
            Err(e) => return e,
        };

        let spec = descriptor.exception();
        let body = spec.body.and_then(|ty| {
            if raw_body.is_empty() {
                return None;
            }
            self.decode(raw_body.as_bytes(), ty)
                .inspect_err(|e| tracing::debug!(error = %e, "error payload did not decode"))
                .ok()
        });

        let parts = ErrorParts {
            message: format!("Status code {}, {raw_body}", status.as_u16()),
            status,
            headers,
            raw_body,
            body,
        };
        match self.exceptions.construct(&spec.kind, parts) {
            Ok(err) => err.into(),
            Err(e) => e,
        }
    }
}
