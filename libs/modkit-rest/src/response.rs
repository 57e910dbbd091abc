use crate::error::{BoxError, RestError};
use bytes::Bytes;
use futures::Stream;
use http::{HeaderMap, Response, StatusCode};
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

/// Parse `Retry-After` header value into a `Duration`.
///
/// Supports both RFC 9110 forms: delay seconds (`"120"`) and an HTTP-date.
/// Returns `None` when the header is missing, unparsable, negative or in the past.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        return u64::try_from(seconds).ok().map(Duration::from_secs);
    }

    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(SystemTime::now()).ok()
}

/// Type-erased response body (raw or transparently decompressed).
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pin_project! {
    /// Body wrapper that enforces a byte limit while streaming.
    ///
    /// Yields [`RestError::BodyTooLarge`] once more than `limit` decompressed
    /// bytes have been read.
    pub struct LimitedBody {
        #[pin]
        inner: ResponseBody,
        limit: usize,
        read: usize,
    }
}

impl LimitedBody {
    #[must_use]
    pub fn new(inner: ResponseBody, limit: usize) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }

    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.read
    }
}

impl Body for LimitedBody {
    type Data = Bytes;
    type Error = RestError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    *this.read += data.len();
                    if *this.read > *this.limit {
                        return Poll::Ready(Some(Err(RestError::BodyTooLarge {
                            limit: *this.limit,
                            actual: *this.read,
                        })));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(RestError::Transport(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

pin_project! {
    /// Live response payload handed to callers of stream-returning methods.
    ///
    /// The caller owns it; dropping the stream closes the underlying
    /// connection (or returns it to the pool if fully read).
    pub struct ResponseStream {
        #[pin]
        body: ResponseBody,
    }
}

impl ResponseStream {
    pub(crate) fn new(body: ResponseBody) -> Self {
        Self { body }
    }

    /// Read the remaining payload into memory.
    ///
    /// # Errors
    ///
    /// Returns `RestError::Transport` if the connection fails mid-body.
    pub async fn collect_bytes(self) -> Result<Bytes, RestError> {
        self.body
            .collect()
            .await
            .map(http_body_util::Collected::to_bytes)
            .map_err(RestError::Transport)
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream").finish_non_exhaustive()
    }
}

impl Stream for ResponseStream {
    type Item = Result<Bytes, RestError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            return match this.body.as_mut().poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => Poll::Ready(Some(Ok(data))),
                    // trailers carry no payload
                    Err(_) => continue,
                },
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(RestError::Transport(e)))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

/// A transport response as seen by the materializer and the poll loop.
///
/// Status and headers are available immediately; the body is read at most
/// once through one of the consuming methods.
#[derive(Debug)]
pub struct ResponseDescriptor {
    pub(crate) inner: Response<ResponseBody>,
    pub(crate) max_body_size: usize,
}

impl ResponseDescriptor {
    #[must_use]
    pub fn new(inner: Response<ResponseBody>, max_body_size: usize) -> Self {
        Self {
            inner,
            max_body_size,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Returns the configured max body size for this response.
    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Read the whole body, enforcing `max_body_size`.
    ///
    /// # Errors
    ///
    /// Returns `RestError::BodyTooLarge` if the limit is exceeded, or
    /// `RestError::Transport` if reading fails.
    pub async fn bytes(self) -> Result<Bytes, RestError> {
        read_body_limited(self.inner, self.max_body_size).await
    }

    /// Read the body as UTF-8 text (invalid sequences replaced).
    ///
    /// # Errors
    ///
    /// Same as [`bytes`](Self::bytes).
    pub async fn text(self) -> Result<String, RestError> {
        let body = self.bytes().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Read at most `max_body_size` bytes as text, dropping the rest.
    ///
    /// # Errors
    ///
    /// Returns `RestError::Transport` if reading fails.
    pub async fn text_truncated(self) -> Result<String, RestError> {
        let body = read_body_truncated(self.inner, self.max_body_size).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Hand the body over unread, without a size limit.
    #[must_use]
    pub fn into_stream(self) -> ResponseStream {
        ResponseStream::new(self.inner.into_body())
    }

    /// Body wrapped with the configured size limit.
    #[must_use]
    pub fn into_limited_body(self) -> LimitedBody {
        LimitedBody::new(self.inner.into_body(), self.max_body_size)
    }

    /// Read and discard up to `limit` bytes so the connection can be reused.
    pub(crate) async fn discard(self, limit: usize) {
        if let Err(e) = drain_body(self.inner, limit).await {
            tracing::debug!(error = %e, "failed to drain superseded response body");
        }
    }

    #[must_use]
    pub fn into_inner(self) -> Response<ResponseBody> {
        self.inner
    }
}

/// Read a response body fully, failing once `limit` bytes are exceeded.
///
/// The limit applies to decompressed bytes, so small compressed payloads that
/// expand past it are rejected.
pub async fn read_body_limited(
    response: Response<ResponseBody>,
    limit: usize,
) -> Result<Bytes, RestError> {
    let mut body = std::pin::pin!(LimitedBody::new(response.into_body(), limit));
    let mut collected = Vec::new();

    while let Some(frame) = body.frame().await {
        if let Some(chunk) = frame?.data_ref() {
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}

/// Read a response body up to `limit` bytes; anything past it is not read.
pub(crate) async fn read_body_truncated(
    response: Response<ResponseBody>,
    limit: usize,
) -> Result<Bytes, RestError> {
    let mut body = std::pin::pin!(response.into_body());
    let mut collected = Vec::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(RestError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            let room = limit.saturating_sub(collected.len());
            collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if collected.len() >= limit {
                break;
            }
        }
    }

    Ok(Bytes::from(collected))
}

/// Read and discard up to `limit` body bytes.
///
/// Stops early once the limit is hit; the connection is then not reused.
pub(crate) async fn drain_body(
    response: Response<ResponseBody>,
    limit: usize,
) -> Result<(), RestError> {
    let mut body = std::pin::pin!(response.into_body());
    let mut drained = 0usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(RestError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            drained += chunk.len();
            if drained >= limit {
                break;
            }
        }
    }

    Ok(())
}

/// Box an in-memory payload as a [`ResponseBody`].
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    http_body_util::Full::new(data.into())
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}
