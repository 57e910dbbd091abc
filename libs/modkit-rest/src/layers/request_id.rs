use http::{HeaderName, HeaderValue, Request};
use std::task::{Context, Poll};
use tower::{Layer, Service};
use uuid::Uuid;

/// Identifies one logical call; identical on every retry of that call.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Identifies one physical attempt; fresh on every retry.
pub const ATTEMPT_ID_HEADER: HeaderName = HeaderName::from_static("x-attempt-id");

pub(crate) fn fresh_id() -> HeaderValue {
    // a hyphenated UUID is always a valid header value
    HeaderValue::from_str(&Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

/// Makes sure every logical call carries an `x-request-id`.
///
/// Sits outside the retry stage so all attempts share the value. The
/// dispatcher stamps its own id before sending; this layer fills the gap
/// for requests sent straight through [`RestClient::send`](crate::RestClient::send).
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestIdLayer;

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for RequestIdService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        req.headers_mut()
            .entry(REQUEST_ID_HEADER)
            .or_insert_with(fresh_id);
        self.inner.call(req)
    }
}

/// Stamps a fresh `x-attempt-id` on each physical attempt.
///
/// Sits inside the retry stage, so a call retried twice reaches the server
/// with three distinct attempt ids.
#[derive(Clone, Copy, Debug, Default)]
pub struct AttemptIdLayer;

impl<S> Layer<S> for AttemptIdLayer {
    type Service = AttemptIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AttemptIdService { inner }
    }
}

#[derive(Clone)]
pub struct AttemptIdService<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for AttemptIdService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        req.headers_mut().insert(ATTEMPT_ID_HEADER, fresh_id());
        self.inner.call(req)
    }
}
