use crate::error::RestError;
use base64::Engine;
use bytes::Bytes;
use serde::Serialize;

/// A runtime argument of an interface method call.
///
/// Arguments are matched to the method's parameter bindings by position.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Absent value: omitted from query and headers, no request body
    Null,
    /// Text, sent as-is (`application/octet-stream` when used as a body)
    Text(String),
    /// Raw bytes (`application/octet-stream` when used as a body)
    Bytes(Bytes),
    /// Structured value, encoded by the configured codec when used as a body
    Json(serde_json::Value),
    /// Multi-value query parameter or header
    List(Vec<String>),
    /// Header collection bound to a prefix, keyed by header suffix
    Map(Vec<(String, String)>),
}

impl Arg {
    /// Serialize any value into an [`Arg::Json`].
    ///
    /// # Errors
    ///
    /// Returns `RestError::Serialization` if `value` cannot be represented as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, RestError> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|e| RestError::serialization(std::any::type_name::<T>(), e))
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null | Self::Json(serde_json::Value::Null))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Single-value rendering used for path, query and header positions.
    ///
    /// `None` for null values and for maps, which have no scalar form.
    pub(crate) fn scalar(&self) -> Option<String> {
        match self {
            Self::Null | Self::Map(_) | Self::Json(serde_json::Value::Null) => None,
            Self::Text(text) => Some(text.clone()),
            Self::Bytes(bytes) => Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            Self::Json(serde_json::Value::String(text)) => Some(text.clone()),
            Self::Json(value) => Some(value.to_string()),
            Self::List(items) => Some(items.join(",")),
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for Arg {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<serde_json::Value> for Arg {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Self::Json(value.into())
    }
}

impl From<u64> for Arg {
    fn from(value: u64) -> Self {
        Self::Json(value.into())
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Self::Json(value.into())
    }
}

impl From<Vec<String>> for Arg {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
