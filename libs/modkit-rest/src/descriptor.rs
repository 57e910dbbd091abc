//! Declarative method schema and its parsed, validated form.
//!
//! A [`MethodSpec`] describes one interface method the way a caller writes
//! it down; [`MethodDescriptor::parse`] checks it for contradictions and
//! resolves it into the shape the request builder, the materializer and the
//! dispatcher work from.

use crate::error::RestError;
use crate::exception::DEFAULT_EXCEPTION;
use crate::poll::PollStrategy;
use crate::template::PathTemplate;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

type DecodeFn = fn(serde_json::Value) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error>;

/// A deserializable target type, erased so descriptors can be stored
/// side by side.
#[derive(Clone, Copy)]
pub struct ValueType {
    name: &'static str,
    decode: DecodeFn,
}

impl ValueType {
    #[must_use]
    pub fn of<T: DeserializeOwned + Send + Sync + 'static>() -> Self {
        fn decode<T: DeserializeOwned + Send + Sync + 'static>(
            value: serde_json::Value,
        ) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error> {
            Ok(Box::new(serde_json::from_value::<T>(value)?))
        }

        Self {
            name: std::any::type_name::<T>(),
            decode: decode::<T>,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn decode(
        &self,
        value: serde_json::Value,
    ) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error> {
        (self.decode)(value)
    }
}

impl fmt::Debug for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueType").field(&self.name).finish()
    }
}

/// Declared return type of a method.
#[derive(Debug, Clone)]
pub enum ReturnType {
    /// Nothing; the body is discarded
    Void,
    /// Payload decoded into a value of the given type
    Value(ValueType),
    /// Whole payload as bytes
    Bytes,
    /// Live, unread payload stream
    Stream,
    /// `true` when a HEAD request answered 2xx
    HeadStatus,
    /// The inner type, delivered through an async handle
    Async(Box<ReturnType>),
}

impl ReturnType {
    #[must_use]
    pub fn value<T: DeserializeOwned + Send + Sync + 'static>() -> Self {
        Self::Value(ValueType::of::<T>())
    }

    #[must_use]
    pub fn async_of(inner: ReturnType) -> Self {
        Self::Async(Box::new(inner))
    }
}

/// How a list argument of a query parameter is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionFormat {
    /// `k=a&k=b`
    Multi,
    /// `k=a,b`
    #[default]
    Csv,
    /// `k=a b`
    Ssv,
    /// `k=a\tb`
    Tsv,
    /// `k=a|b`
    Pipes,
}

impl CollectionFormat {
    /// Separator for joined formats; `None` for [`Multi`](Self::Multi).
    #[must_use]
    pub fn separator(self) -> Option<&'static str> {
        match self {
            Self::Multi => None,
            Self::Csv => Some(","),
            Self::Ssv => Some(" "),
            Self::Tsv => Some("\t"),
            Self::Pipes => Some("|"),
        }
    }
}

#[derive(Debug, Clone)]
enum ParamSpec {
    Path { name: String, encoded: bool },
    Query { name: String, encoded: bool, format: CollectionFormat },
    Header { name: String },
    HeaderMap { prefix: String },
    Body { content_type: Option<String> },
}

/// Declarative description of one interface method.
///
/// Parameters are bound in the order they are declared; that order is the
/// order of the call arguments.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    name: String,
    method: Method,
    path: String,
    params: Vec<ParamSpec>,
    static_headers: Vec<(String, String)>,
    content_type: Option<String>,
    expected: Vec<u16>,
    exception: String,
    exception_body: Option<ValueType>,
    returns: ReturnType,
    poller: Option<Arc<dyn PollStrategy>>,
}

impl MethodSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method,
            path: path.into(),
            params: Vec::new(),
            static_headers: Vec::new(),
            content_type: None,
            expected: Vec::new(),
            exception: DEFAULT_EXCEPTION.to_owned(),
            exception_body: None,
            returns: ReturnType::Void,
            poller: None,
        }
    }

    /// Bind the next argument to the `{name}` placeholder, percent-encoded.
    #[must_use]
    pub fn path_param(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec::Path {
            name: name.into(),
            encoded: false,
        });
        self
    }

    /// Bind the next argument to `{name}` verbatim (already encoded).
    #[must_use]
    pub fn encoded_path_param(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec::Path {
            name: name.into(),
            encoded: true,
        });
        self
    }

    #[must_use]
    pub fn query(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec::Query {
            name: name.into(),
            encoded: false,
            format: CollectionFormat::default(),
        });
        self
    }

    /// Bind the next argument to a query parameter sent verbatim.
    #[must_use]
    pub fn encoded_query(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec::Query {
            name: name.into(),
            encoded: true,
            format: CollectionFormat::default(),
        });
        self
    }

    /// Bind the next (list) argument to a multi-valued query parameter.
    #[must_use]
    pub fn query_list(mut self, name: impl Into<String>, format: CollectionFormat) -> Self {
        self.params.push(ParamSpec::Query {
            name: name.into(),
            encoded: false,
            format,
        });
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec::Header { name: name.into() });
        self
    }

    /// Bind the next (map) argument to headers named `prefix + key`.
    #[must_use]
    pub fn header_map(mut self, prefix: impl Into<String>) -> Self {
        self.params.push(ParamSpec::HeaderMap {
            prefix: prefix.into(),
        });
        self
    }

    #[must_use]
    pub fn body(mut self) -> Self {
        self.params.push(ParamSpec::Body { content_type: None });
        self
    }

    #[must_use]
    pub fn body_with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.params.push(ParamSpec::Body {
            content_type: Some(content_type.into()),
        });
        self
    }

    /// Header sent with every call of this method.
    #[must_use]
    pub fn static_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.static_headers.push((name.into(), value.into()));
        self
    }

    /// Method-level body content type, ahead of everything else.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Status codes treated as success; any 2xx when never called.
    #[must_use]
    pub fn expect(mut self, codes: &[u16]) -> Self {
        self.expected.extend_from_slice(codes);
        self
    }

    /// Exception kind constructed on an unexpected status.
    #[must_use]
    pub fn exception(mut self, kind: impl Into<String>) -> Self {
        self.exception = kind.into();
        self
    }

    /// Type the error payload is decoded into for the exception.
    #[must_use]
    pub fn exception_body<T: DeserializeOwned + Send + Sync + 'static>(mut self) -> Self {
        self.exception_body = Some(ValueType::of::<T>());
        self
    }

    #[must_use]
    pub fn returns(mut self, returns: ReturnType) -> Self {
        self.returns = returns;
        self
    }

    /// Treat the method as a long-running operation polled by `poller`.
    #[must_use]
    pub fn long_running(mut self, poller: impl PollStrategy + 'static) -> Self {
        self.poller = Some(Arc::new(poller));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A resolved parameter binding.
#[derive(Debug, Clone)]
pub enum Binding {
    Path {
        placeholder: String,
        encoded: bool,
    },
    Query {
        name: String,
        encoded: bool,
        format: CollectionFormat,
    },
    Header {
        name: HeaderName,
    },
    HeaderMap {
        prefix: String,
    },
    Body {
        content_type: Option<HeaderValue>,
    },
}

/// Status codes a method treats as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedStatus {
    AnySuccess,
    Codes(BTreeSet<u16>),
}

impl ExpectedStatus {
    #[must_use]
    pub fn contains(&self, status: StatusCode) -> bool {
        match self {
            Self::AnySuccess => status.is_success(),
            Self::Codes(codes) => codes.contains(&status.as_u16()),
        }
    }
}

/// What the materializer produces on success.
#[derive(Debug, Clone)]
pub enum ReturnShape {
    Void,
    Value(ValueType),
    Bytes,
    Stream,
    HeadStatus,
}

/// Which entry point a method is invoked through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Blocking,
    Async,
}

/// Exception declared for unexpected statuses.
#[derive(Debug, Clone)]
pub struct ExceptionSpec {
    pub kind: String,
    pub body: Option<ValueType>,
}

/// Parsed, immutable shape of one interface method's HTTP contract.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    name: String,
    method: Method,
    template: PathTemplate,
    bindings: Vec<Binding>,
    static_headers: HeaderMap,
    content_type: Option<HeaderValue>,
    expected: ExpectedStatus,
    exception: ExceptionSpec,
    shape: ReturnShape,
    mode: CallMode,
    poller: Option<Arc<dyn PollStrategy>>,
}

impl MethodDescriptor {
    /// Validate `spec` and resolve it into a descriptor.
    ///
    /// # Errors
    ///
    /// Returns `RestError::MalformedInterface` when the declaration
    /// contradicts itself: more than one body, path placeholders and path
    /// bindings that do not match one to one, a bad template, nested async
    /// return types, a HEAD-status return on a non-HEAD verb, status codes
    /// outside 100-599, invalid header names or values, or a poller on a
    /// blocking method.
    pub fn parse(spec: &MethodSpec) -> Result<Self, RestError> {
        let malformed = |reason: String| RestError::malformed(&spec.name, reason);

        let template = PathTemplate::parse(&spec.path)
            .map_err(|e| malformed(format!("invalid path template '{}': {e}", spec.path)))?;

        let mut bindings = Vec::with_capacity(spec.params.len());
        let mut bound = HashSet::new();
        let mut has_body = false;
        for param in &spec.params {
            let binding = match param {
                ParamSpec::Path { name, encoded } => {
                    if !bound.insert(name.as_str()) {
                        return Err(malformed(format!("placeholder '{{{name}}}' is bound twice")));
                    }
                    if !template.placeholders().any(|p| p == name.as_str()) {
                        return Err(malformed(format!(
                            "path parameter '{name}' has no placeholder in '{}'",
                            spec.path
                        )));
                    }
                    Binding::Path {
                        placeholder: name.clone(),
                        encoded: *encoded,
                    }
                }
                ParamSpec::Query {
                    name,
                    encoded,
                    format,
                } => Binding::Query {
                    name: name.clone(),
                    encoded: *encoded,
                    format: *format,
                },
                ParamSpec::Header { name } => Binding::Header {
                    name: header_name(name).map_err(malformed)?,
                },
                ParamSpec::HeaderMap { prefix } => {
                    if !prefix.is_empty() {
                        header_name(prefix).map_err(malformed)?;
                    }
                    Binding::HeaderMap {
                        prefix: prefix.to_ascii_lowercase(),
                    }
                }
                ParamSpec::Body { content_type } => {
                    if has_body {
                        return Err(malformed("more than one body parameter".to_owned()));
                    }
                    has_body = true;
                    Binding::Body {
                        content_type: content_type
                            .as_deref()
                            .map(header_value)
                            .transpose()
                            .map_err(malformed)?,
                    }
                }
            };
            bindings.push(binding);
        }

        if let Some(unbound) = template.placeholders().find(|p| !bound.contains(p)) {
            return Err(malformed(format!(
                "placeholder '{{{unbound}}}' has no path parameter"
            )));
        }

        let mut static_headers = HeaderMap::new();
        for (name, value) in &spec.static_headers {
            let name = header_name(name).map_err(malformed)?;
            static_headers.append(name, header_value(value).map_err(malformed)?);
        }
        let content_type = spec
            .content_type
            .as_deref()
            .map(header_value)
            .transpose()
            .map_err(malformed)?;

        let expected = if spec.expected.is_empty() {
            ExpectedStatus::AnySuccess
        } else {
            if let Some(code) = spec.expected.iter().find(|c| !(100..=599).contains(*c)) {
                return Err(malformed(format!("expected status {code} is not an HTTP status")));
            }
            ExpectedStatus::Codes(spec.expected.iter().copied().collect())
        };

        let (shape, mode) = match &spec.returns {
            ReturnType::Async(inner) => {
                if matches!(**inner, ReturnType::Async(_)) {
                    return Err(malformed("async return type wraps another async type".to_owned()));
                }
                (shape_of(inner), CallMode::Async)
            }
            other => (shape_of(other), CallMode::Blocking),
        };
        if matches!(shape, ReturnShape::HeadStatus) && spec.method != Method::HEAD {
            return Err(malformed(format!(
                "boolean status return requires HEAD, not {}",
                spec.method
            )));
        }
        if spec.poller.is_some() && mode != CallMode::Async {
            return Err(malformed("long-running polling requires an async return type".to_owned()));
        }

        Ok(Self {
            name: spec.name.clone(),
            method: spec.method.clone(),
            template,
            bindings,
            static_headers,
            content_type,
            expected,
            exception: ExceptionSpec {
                kind: spec.exception.clone(),
                body: spec.exception_body,
            },
            shape,
            mode,
            poller: spec.poller.clone(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    #[must_use]
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    #[must_use]
    pub fn static_headers(&self) -> &HeaderMap {
        &self.static_headers
    }

    /// Method-level content type override.
    #[must_use]
    pub fn content_type(&self) -> Option<&HeaderValue> {
        self.content_type.as_ref()
    }

    #[must_use]
    pub fn expected(&self) -> &ExpectedStatus {
        &self.expected
    }

    #[must_use]
    pub fn exception(&self) -> &ExceptionSpec {
        &self.exception
    }

    #[must_use]
    pub fn shape(&self) -> &ReturnShape {
        &self.shape
    }

    #[must_use]
    pub fn mode(&self) -> CallMode {
        self.mode
    }

    #[must_use]
    pub fn poller(&self) -> Option<&Arc<dyn PollStrategy>> {
        self.poller.as_ref()
    }
}

fn shape_of(returns: &ReturnType) -> ReturnShape {
    match returns {
        // nested Async is rejected before this is reached
        ReturnType::Void | ReturnType::Async(_) => ReturnShape::Void,
        ReturnType::Value(ty) => ReturnShape::Value(*ty),
        ReturnType::Bytes => ReturnShape::Bytes,
        ReturnType::Stream => ReturnShape::Stream,
        ReturnType::HeadStatus => ReturnShape::HeadStatus,
    }
}

fn header_name(name: &str) -> Result<HeaderName, String> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|e| format!("invalid header name '{name}': {e}"))
}

fn header_value(value: &str) -> Result<HeaderValue, String> {
    HeaderValue::from_str(value).map_err(|e| format!("invalid header value '{value}': {e}"))
}
