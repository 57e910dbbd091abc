//! Typed errors raised for unexpected response statuses and the registry of
//! factories that construct them.

use crate::error::{BoxError, RestError};
use http::{HeaderMap, StatusCode};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Exception kind used when a method declares none.
pub const DEFAULT_EXCEPTION: &str = "ServiceError";

/// Everything the materializer learned about a failed response, handed to
/// the exception factory.
pub struct ErrorParts {
    /// `"Status code {code}, {rawBody}"`
    pub message: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub raw_body: String,
    /// Error payload decoded as the declared exception body type, if possible
    pub body: Option<Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for ErrorParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorParts")
            .field("message", &self.message)
            .field("status", &self.status)
            .field("has_body", &self.body.is_some())
            .finish_non_exhaustive()
    }
}

/// A typed error built from an unexpected response.
///
/// `kind` names the exception declared on the method; the decoded error
/// payload is available through [`body`](Self::body).
pub struct ServiceError {
    kind: String,
    message: String,
    status: StatusCode,
    headers: HeaderMap,
    raw_body: String,
    body: Option<Box<dyn Any + Send + Sync>>,
}

impl ServiceError {
    #[must_use]
    pub fn new(kind: impl Into<String>, parts: ErrorParts) -> Self {
        Self {
            kind: kind.into(),
            message: parts.message,
            status: parts.status,
            headers: parts.headers,
            raw_body: parts.raw_body,
            body: parts.body,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn raw_body(&self) -> &str {
        &self.raw_body
    }

    /// The decoded error payload, if it was decoded as a `T`.
    #[must_use]
    pub fn body<T: Any>(&self) -> Option<&T> {
        self.body.as_ref()?.downcast_ref()
    }

    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

impl fmt::Debug for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceError")
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("message", &self.message)
            .field("has_body", &self.body.is_some())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ServiceError {}

/// Builds the exception for one declared kind.
pub type ExceptionFactory =
    Arc<dyn Fn(ErrorParts) -> Result<ServiceError, BoxError> + Send + Sync>;

/// Lookup table from exception kind to factory.
///
/// A method whose declared kind has no factory fails with
/// `RestError::ExceptionConstruction` on its first unexpected status.
#[derive(Clone, Default)]
pub struct ExceptionRegistry {
    factories: HashMap<String, ExceptionFactory>,
}

impl ExceptionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that knows [`DEFAULT_EXCEPTION`].
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_kind(DEFAULT_EXCEPTION);
        registry
    }

    /// Register `factory` for `kind`, replacing any previous one.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn(ErrorParts) -> Result<ServiceError, BoxError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.factories.insert(kind.into(), Arc::new(factory));
        self
    }

    /// Register a factory that wraps the parts unchanged under `kind`.
    pub fn register_kind(&mut self, kind: impl Into<String>) -> &mut Self {
        let kind = kind.into();
        let name = kind.clone();
        self.register(kind, move |parts| Ok(ServiceError::new(name.clone(), parts)))
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Construct the `kind` exception from `parts`.
    ///
    /// # Errors
    ///
    /// Returns `RestError::ExceptionConstruction` if no factory is registered
    /// for `kind` or the factory fails.
    pub fn construct(&self, kind: &str, parts: ErrorParts) -> Result<ServiceError, RestError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| RestError::ExceptionConstruction {
                exception: kind.to_owned(),
                source: "no factory registered for this exception kind".into(),
            })?;

        factory(parts).map_err(|source| RestError::ExceptionConstruction {
            exception: kind.to_owned(),
            source,
        })
    }
}

impl fmt::Debug for ExceptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("ExceptionRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct ErrorBody {
        code: String,
    }

    fn parts(body: Option<Box<dyn Any + Send + Sync>>) -> ErrorParts {
        ErrorParts {
            message: r#"Status code 400, {"code":"bad"}"#.to_owned(),
            status: StatusCode::BAD_REQUEST,
            headers: HeaderMap::new(),
            raw_body: r#"{"code":"bad"}"#.to_owned(),
            body,
        }
    }

    #[test]
    fn test_registered_kind_constructs() {
        let mut registry = ExceptionRegistry::with_defaults();
        registry.register_kind("ApiError");

        let err = registry
            .construct(
                "ApiError",
                parts(Some(Box::new(ErrorBody {
                    code: "bad".to_owned(),
                }))),
            )
            .unwrap();

        assert_eq!(err.kind(), "ApiError");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.message().contains("Status code 400"));
        assert_eq!(err.body::<ErrorBody>().map(|b| b.code.as_str()), Some("bad"));
        assert!(err.body::<String>().is_none());
        assert_eq!(err.to_string(), r#"ApiError: Status code 400, {"code":"bad"}"#);
    }

    #[test]
    fn test_missing_factory_is_construction_error() {
        let registry = ExceptionRegistry::with_defaults();
        let err = registry.construct("Unknown", parts(None)).unwrap_err();

        assert!(matches!(
            &err,
            RestError::ExceptionConstruction { exception, .. } if exception == "Unknown"
        ));
        assert!(err.to_string().contains("Could not instantiate exception type 'Unknown'"));
    }

    #[test]
    fn test_failing_factory_wraps_cause() {
        let mut registry = ExceptionRegistry::new();
        registry.register("Strict", |parts| {
            if parts.body.is_none() {
                return Err("error body required".into());
            }
            Ok(ServiceError::new("Strict", parts))
        });

        let err = registry.construct("Strict", parts(None)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Could not instantiate exception type 'Strict': error body required"
        );
    }

    #[test]
    fn test_defaults_contain_service_error() {
        assert!(ExceptionRegistry::with_defaults().contains(DEFAULT_EXCEPTION));
        assert!(!ExceptionRegistry::new().contains(DEFAULT_EXCEPTION));
    }
}
