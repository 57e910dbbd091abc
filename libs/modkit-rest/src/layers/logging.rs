use crate::config::LogConfig;
use crate::error::{BoxError, RestError};
use crate::response::{ResponseBody, full_body};
use crate::security::{REDACTED, is_sensitive_header};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Request, Response};
use http_body::Frame;
use http_body_util::{BodyExt, BodyStream, Full, StreamBody};
use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};

/// `tracing` target of every traffic log event.
pub const TRAFFIC_TARGET: &str = "modkit_rest::traffic";

/// Network-adjacent traffic log.
///
/// Emits one `"<VERB> <url> -> <status> (<ms> ms)"` line per attempt and,
/// depending on [`LogLevel`](crate::LogLevel), the headers and bodies of both
/// directions. Sensitive headers are always masked. Response bodies are
/// previewed up to `body_threshold` bytes; the caller still receives the
/// complete payload.
///
/// The preview read runs outside the per-attempt timeout, so it is bounded
/// by its own `preview_timeout`; a body that stalls past it is logged as
/// truncated and handed on unread.
#[derive(Clone, Debug)]
pub struct LoggingLayer {
    config: Arc<LogConfig>,
    preview_timeout: Duration,
}

/// Default bound on reading a response body preview.
pub const DEFAULT_PREVIEW_TIMEOUT: Duration = Duration::from_secs(30);

impl LoggingLayer {
    #[must_use]
    pub fn new(config: LogConfig) -> Self {
        Self {
            config: Arc::new(config),
            preview_timeout: DEFAULT_PREVIEW_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_preview_timeout(mut self, timeout: Duration) -> Self {
        self.preview_timeout = timeout;
        self
    }
}

impl Default for LoggingLayer {
    fn default() -> Self {
        Self::new(LogConfig::default())
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService {
            inner,
            config: Arc::clone(&self.config),
            preview_timeout: self.preview_timeout,
        }
    }
}

#[derive(Clone)]
pub struct LoggingService<S> {
    inner: S,
    config: Arc<LogConfig>,
    preview_timeout: Duration,
}

fn render_headers(headers: &HeaderMap, redacted: &[String]) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        let shown = if value.is_sensitive() || is_sensitive_header(name, redacted) {
            REDACTED
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        if !out.is_empty() {
            out.push_str(", ");
        }
        let _ = write!(out, "{name}: {shown}");
    }
    out
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"))
}

/// Text shown for a body; `complete` is false when only a prefix was read.
fn render_body(bytes: &[u8], complete: bool, json: bool, config: &LogConfig) -> String {
    if bytes.is_empty() {
        return "<empty>".to_owned();
    }
    let limit = bytes.len().min(config.body_threshold);
    let truncated = !complete || bytes.len() > config.body_threshold;

    if config.pretty_json
        && json
        && !truncated
        && let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes)
        && let Ok(pretty) = serde_json::to_string_pretty(&value)
    {
        return pretty;
    }

    let mut text = String::from_utf8_lossy(&bytes[..limit]).into_owned();
    if truncated {
        text.push_str(" ...(truncated)");
    }
    text
}

/// Read up to `threshold` bytes of `body` for the log, then hand back a body
/// that replays them followed by whatever was not read.
///
/// Reading stops at `budget`; the preview is then reported incomplete.
async fn tap_body(
    mut body: ResponseBody,
    threshold: usize,
    budget: Duration,
) -> (Bytes, bool, ResponseBody) {
    let mut head = BytesMut::new();
    let mut failure: Option<BoxError> = None;
    let mut complete = false;
    let deadline = tokio::time::Instant::now() + budget;

    while head.len() <= threshold {
        let Ok(next) = tokio::time::timeout_at(deadline, body.frame()).await else {
            tracing::debug!(target: TRAFFIC_TARGET, "response body preview timed out");
            break;
        };
        match next {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    head.extend_from_slice(data);
                }
            }
            Some(Err(e)) => {
                failure = Some(e);
                break;
            }
            None => {
                complete = true;
                break;
            }
        }
    }

    let head = head.freeze();
    if complete {
        return (head.clone(), true, full_body(head));
    }

    let replay = futures::stream::iter([Ok::<_, BoxError>(Frame::data(head.clone()))]);
    let rest: ResponseBody = match failure {
        Some(e) => StreamBody::new(futures::stream::iter([Err::<Frame<Bytes>, _>(e)])).boxed(),
        None => body,
    };
    let chained = futures::StreamExt::chain(replay, BodyStream::new(rest));
    (head, false, StreamBody::new(chained).boxed())
}

async fn request_bytes(body: &Full<Bytes>) -> Bytes {
    match body.clone().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(never) => match never {},
    }
}

impl<S> Service<Request<Full<Bytes>>> for LoggingService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResponseBody>, Error = RestError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = RestError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = Arc::clone(&self.config);
        let preview_timeout = self.preview_timeout;

        let level = config.level;
        if level == crate::config::LogLevel::None {
            return Box::pin(inner.call(req));
        }

        Box::pin(async move {
            let method = req.method().clone();
            let url = req.uri().clone();

            if level.logs_headers() {
                tracing::info!(
                    target: TRAFFIC_TARGET,
                    headers = %render_headers(req.headers(), &config.redacted_headers),
                    "--> {method} {url} request headers"
                );
            }
            if level.logs_body() {
                let sent = request_bytes(req.body()).await;
                tracing::info!(
                    target: TRAFFIC_TARGET,
                    body = %render_body(&sent, true, is_json(req.headers()), &config),
                    "--> {method} {url} request body"
                );
            }

            let started = Instant::now();
            let outcome = inner.call(req).await;
            let elapsed_ms = started.elapsed().as_millis();

            let resp = match outcome {
                Ok(resp) => resp,
                Err(err) => {
                    tracing::warn!(
                        target: TRAFFIC_TARGET,
                        error = %err,
                        "{method} {url} -> failed ({elapsed_ms} ms)"
                    );
                    return Err(err);
                }
            };

            let status = resp.status().as_u16();
            tracing::info!(
                target: TRAFFIC_TARGET,
                "{method} {url} -> {status} ({elapsed_ms} ms)"
            );

            if level.logs_headers() {
                tracing::info!(
                    target: TRAFFIC_TARGET,
                    headers = %render_headers(resp.headers(), &config.redacted_headers),
                    "<-- {status} {url} response headers"
                );
            }
            if !level.logs_body() {
                return Ok(resp);
            }

            let (parts, body) = resp.into_parts();
            let (head, complete, body) = tap_body(body, config.body_threshold, preview_timeout).await;
            tracing::info!(
                target: TRAFFIC_TARGET,
                body = %render_body(&head, complete, is_json(&parts.headers), &config),
                "<-- {status} {url} response body"
            );
            Ok(Response::from_parts(parts, body))
        })
    }
}
