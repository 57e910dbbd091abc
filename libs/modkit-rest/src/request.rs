use crate::args::Arg;
use crate::codec::BodyCodec;
use crate::config::TransportSecurity;
use crate::descriptor::{Binding, MethodDescriptor};
use crate::error::{InvalidUriKind, RestError};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request};
use http_body_util::Full;
use std::collections::HashMap;

const OCTET_STREAM: &str = "application/octet-stream";

/// A fully resolved HTTP request, ready for the pipeline.
///
/// Building is deterministic: the same descriptor and arguments always give
/// equal request descriptors. Request and attempt ids are added later.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestDescriptor {
    /// A body-less request with no headers.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Add a header, replacing previous values.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` or `value` is not a valid header.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, RestError> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        self.headers.insert(name, HeaderValue::from_str(value)?);
        Ok(self)
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Resolve `descriptor` against the call arguments.
    ///
    /// # Errors
    ///
    /// Returns `RestError::MalformedInterface` if the argument count does not
    /// match the bindings, a path argument is null, or an argument cannot be
    /// rendered at its position. Returns `RestError::Serialization` if the
    /// body cannot be encoded.
    pub fn build(
        descriptor: &MethodDescriptor,
        args: &[Arg],
        base_url: &str,
        codec: &dyn BodyCodec,
    ) -> Result<Self, RestError> {
        let malformed = |reason: String| RestError::malformed(descriptor.name(), reason);

        if args.len() != descriptor.bindings().len() {
            return Err(malformed(format!(
                "expected {} arguments, got {}",
                descriptor.bindings().len(),
                args.len()
            )));
        }

        let mut path_values: HashMap<&str, String> = HashMap::new();
        let mut query: Vec<(String, String)> = Vec::new();
        let mut headers = descriptor.static_headers().clone();
        let mut body: Option<(&Arg, Option<&HeaderValue>)> = None;

        for (binding, arg) in descriptor.bindings().iter().zip(args) {
            match binding {
                Binding::Path {
                    placeholder,
                    encoded,
                } => {
                    if matches!(arg, Arg::Map(_)) {
                        return Err(malformed(format!(
                            "map argument bound to path placeholder '{{{placeholder}}}'"
                        )));
                    }
                    if let Some(value) = arg.scalar() {
                        let value = if *encoded {
                            value
                        } else {
                            urlencoding::encode(&value).into_owned()
                        };
                        path_values.insert(placeholder.as_str(), value);
                    }
                }
                Binding::Query {
                    name,
                    encoded,
                    format,
                } => {
                    let encode = |s: &str| {
                        if *encoded {
                            s.to_owned()
                        } else {
                            urlencoding::encode(s).into_owned()
                        }
                    };
                    match arg {
                        Arg::Map(_) => {
                            return Err(malformed(format!(
                                "map argument bound to query parameter '{name}'"
                            )));
                        }
                        Arg::List(items) if items.is_empty() => {}
                        Arg::List(items) => match format.separator() {
                            None => query.extend(items.iter().map(|item| (encode(name), encode(item)))),
                            Some(sep) => query.push((encode(name), encode(&items.join(sep)))),
                        },
                        other => {
                            if let Some(value) = other.scalar() {
                                query.push((encode(name), encode(&value)));
                            }
                        }
                    }
                }
                Binding::Header { name } => {
                    if matches!(arg, Arg::Map(_)) {
                        return Err(malformed(format!("map argument bound to header '{name}'")));
                    }
                    if let Some(value) = arg.scalar() {
                        let value = HeaderValue::from_str(&value)
                            .map_err(|e| malformed(format!("invalid value for header '{name}': {e}")))?;
                        headers.insert(name.clone(), value);
                    }
                }
                Binding::HeaderMap { prefix } => match arg {
                    Arg::Null => {}
                    Arg::Map(entries) => {
                        for (key, value) in entries {
                            let full = format!("{prefix}{key}");
                            let name = HeaderName::from_bytes(full.as_bytes())
                                .map_err(|e| malformed(format!("invalid header name '{full}': {e}")))?;
                            let value = HeaderValue::from_str(value)
                                .map_err(|e| malformed(format!("invalid value for header '{full}': {e}")))?;
                            headers.insert(name, value);
                        }
                    }
                    other => {
                        return Err(malformed(format!(
                            "{} argument bound to header collection '{prefix}'",
                            other.kind()
                        )));
                    }
                },
                Binding::Body { content_type } => body = Some((arg, content_type.as_ref())),
            }
        }

        let path = descriptor
            .template()
            .expand(|name| path_values.get(name).map(String::as_str))
            .map_err(|name| malformed(format!("path placeholder '{{{name}}}' resolved to null")))?;

        let mut url = join_url(base_url, &path);
        if !query.is_empty() {
            let rendered: Vec<String> = query.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&rendered.join("&"));
        }

        let body = match body {
            Some((arg, binding_type)) => {
                encode_body(arg, binding_type, descriptor, &mut headers, codec)?
            }
            None => None,
        };

        Ok(Self {
            method: descriptor.method().clone(),
            url,
            headers,
            body,
        })
    }

    /// Validate the URL against `transport` and convert into an HTTP request.
    ///
    /// # Errors
    ///
    /// Returns `RestError::InvalidUri` for unparsable or host-less URLs and
    /// `RestError::InvalidScheme` for schemes the transport does not allow.
    pub fn into_http(self, transport: TransportSecurity) -> Result<Request<Full<Bytes>>, RestError> {
        let uri = validate_url(&self.url, transport)?;

        let mut request = Request::new(Full::new(self.body.unwrap_or_default()));
        *request.method_mut() = self.method;
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers;
        Ok(request)
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_owned();
    }
    match (base_url.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base_url}{}", &path[1..]),
        (false, false) if !path.is_empty() => format!("{base_url}/{path}"),
        _ => format!("{base_url}{path}"),
    }
}

/// Encode the body argument and settle its `Content-Type`.
///
/// Resolution order: binding or method override, a value already present
/// in `headers`, then inference from the argument.
fn encode_body(
    arg: &Arg,
    binding_type: Option<&HeaderValue>,
    descriptor: &MethodDescriptor,
    headers: &mut HeaderMap,
    codec: &dyn BodyCodec,
) -> Result<Option<Bytes>, RestError> {
    let (bytes, inferred) = match arg {
        Arg::Null | Arg::Json(serde_json::Value::Null) => return Ok(None),
        Arg::Text(text) if text.is_empty() => return Ok(None),
        Arg::Text(text) => (Bytes::from(text.clone()), OCTET_STREAM),
        Arg::Bytes(bytes) => (bytes.clone(), OCTET_STREAM),
        Arg::Json(value) => (encode_json(value, descriptor, codec)?, codec.content_type()),
        Arg::List(items) => (encode_json(&serde_json::json!(items), descriptor, codec)?, codec.content_type()),
        Arg::Map(entries) => {
            let object: serde_json::Map<String, serde_json::Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            (encode_json(&serde_json::Value::Object(object), descriptor, codec)?, codec.content_type())
        }
    };

    if let Some(explicit) = binding_type.or(descriptor.content_type()) {
        headers.insert(CONTENT_TYPE, explicit.clone());
    } else if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(inferred));
    }
    Ok(Some(bytes))
}

fn encode_json(
    value: &serde_json::Value,
    descriptor: &MethodDescriptor,
    codec: &dyn BodyCodec,
) -> Result<Bytes, RestError> {
    codec
        .encode(value)
        .map_err(|e| RestError::serialization(format!("{} request body", descriptor.name()), e))
}

/// Parse `url` and check that the transport may use its scheme.
pub(crate) fn validate_url(url: &str, transport: TransportSecurity) -> Result<http::Uri, RestError> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e: http::uri::InvalidUri| RestError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::ParseError,
            reason: e.to_string(),
        })?;

    if uri.authority().is_none() {
        return Err(RestError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::MissingAuthority,
            reason: "missing host/authority".to_owned(),
        });
    }

    match uri.scheme_str() {
        Some("https") => Ok(uri),
        Some("http") => match transport {
            TransportSecurity::AllowInsecureHttp => Ok(uri),
            TransportSecurity::TlsOnly => Err(RestError::InvalidScheme {
                scheme: "http".to_owned(),
                reason: "HTTPS required (transport security is TlsOnly)".to_owned(),
            }),
        },
        Some(scheme) => Err(RestError::InvalidScheme {
            scheme: scheme.to_owned(),
            reason: "only http:// and https:// schemes are supported".to_owned(),
        }),
        None => Err(RestError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::MissingScheme,
            reason: "missing scheme".to_owned(),
        }),
    }
}
