use crate::config::{ExponentialBackoff, RetryPolicy, RetryTrigger};
use crate::error::RestError;
use crate::layers::REQUEST_ID_HEADER;
use crate::response::{ResponseBody, drain_body, parse_retry_after};
use bytes::Bytes;
use http::request::Parts;
use http::{HeaderValue, Request, Response};
use http_body_util::Full;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::{Layer, Service, ServiceExt};

/// Header carrying the 1-based retry number on repeated attempts.
pub const RETRY_ATTEMPT_HEADER: &str = "x-retry-attempt";

/// Tower layer that repeats failed attempts according to a [`RetryPolicy`].
///
/// Both transport errors and responses with retriable statuses are retried.
/// Once retries are exhausted the last outcome is returned as is: the last
/// error, or the last response (whatever its status).
#[derive(Clone)]
pub struct RetryLayer {
    policy: Arc<dyn RetryPolicy>,
    total_timeout: Option<Duration>,
}

impl RetryLayer {
    #[must_use]
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            policy,
            total_timeout: None,
        }
    }

    /// Same as [`new`](Self::new) with a deadline spanning all attempts and backoffs.
    #[must_use]
    pub fn with_total_timeout(policy: Arc<dyn RetryPolicy>, total_timeout: Option<Duration>) -> Self {
        Self {
            policy,
            total_timeout,
        }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: Arc::clone(&self.policy),
            total_timeout: self.total_timeout,
        }
    }
}

#[derive(Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: Arc<dyn RetryPolicy>,
    total_timeout: Option<Duration>,
}

/// Wall-clock budget for one logical call.
#[derive(Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn starting_now(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    fn remaining(self) -> Result<Duration, RestError> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            Err(RestError::DeadlineExceeded(self.budget))
        } else {
            Ok(left)
        }
    }
}

fn attempt_request(parts: &Parts, body: &Full<Bytes>, attempt: usize) -> Request<Full<Bytes>> {
    let mut req = Request::from_parts(parts.clone(), body.clone());
    if attempt > 0
        && let Ok(value) = HeaderValue::try_from(attempt.to_string())
    {
        req.headers_mut().insert(RETRY_ATTEMPT_HEADER, value);
    }
    req
}

impl<S> Service<Request<Full<Bytes>>> for RetryService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResponseBody>, Error = RestError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = S::Response;
    type Error = RestError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        // consume the instance that was poll_ready'd
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let policy = Arc::clone(&self.policy);
        let deadline = self.total_timeout.map(Deadline::starting_now);

        let (parts, body) = req.into_parts();
        let keyed = policy.has_idempotency_key(&parts.headers);

        Box::pin(async move {
            let request_id = parts
                .headers
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned);

            let mut attempt = 0usize;
            loop {
                if let Some(deadline) = deadline {
                    deadline.remaining()?;
                }

                let mut svc = inner.clone();
                let attempt_call = async {
                    svc.ready()
                        .await?
                        .call(attempt_request(&parts, &body, attempt))
                        .await
                };
                let outcome = match deadline {
                    Some(deadline) => {
                        tokio::time::timeout(deadline.remaining()?, attempt_call)
                            .await
                            .map_err(|_| RestError::DeadlineExceeded(deadline.budget))?
                    }
                    None => attempt_call.await,
                };

                let (trigger, retry_after) = match &outcome {
                    Ok(resp) => (
                        RetryTrigger::Status(resp.status().as_u16()),
                        parse_retry_after(resp.headers()),
                    ),
                    Err(err) => (trigger_for(err), None),
                };

                if attempt >= policy.max_retries()
                    || !policy.should_retry(trigger, &parts.method, keyed)
                {
                    return outcome;
                }

                let mut wait = policy.backoff(attempt, retry_after);
                match outcome {
                    Ok(resp) => {
                        tracing::debug!(
                            retry = attempt + 1,
                            max_retries = policy.max_retries(),
                            status = resp.status().as_u16(),
                            method = %parts.method,
                            uri = %parts.uri,
                            request_id = ?request_id,
                            retry_after = ?retry_after,
                            "retrying after retriable status"
                        );
                        discard_before_retry(resp, policy.drain_limit()).await;
                    }
                    Err(err) => {
                        tracing::debug!(
                            retry = attempt + 1,
                            max_retries = policy.max_retries(),
                            error = %err,
                            trigger = ?trigger,
                            method = %parts.method,
                            uri = %parts.uri,
                            request_id = ?request_id,
                            "retrying after transport failure"
                        );
                    }
                }

                if let Some(deadline) = deadline {
                    wait = wait.min(deadline.remaining()?);
                }
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        })
    }
}

/// Drain a superseded response so its connection can go back to the pool.
///
/// Bodies whose `Content-Length` exceeds the limit are dropped undrained.
async fn discard_before_retry(resp: Response<ResponseBody>, limit: Option<usize>) {
    let Some(limit) = limit else {
        return;
    };

    let declared = resp
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        tracing::trace!(?declared, limit, "response too large to drain before retry");
        return;
    }

    if let Err(e) = drain_body(resp, limit).await {
        tracing::debug!(error = %e, "drain before retry failed; connection may not be reused");
    }
}

fn trigger_for(err: &RestError) -> RetryTrigger {
    match err {
        RestError::Transport(_) => RetryTrigger::TransportError,
        RestError::Timeout(_) => RetryTrigger::Timeout,
        _ => RetryTrigger::NonRetryable,
    }
}

/// Exponential backoff for retry number `attempt + 1`.
///
/// Non-finite or negative settings fall back to safe values; the result
/// (jitter included) never exceeds `backoff.cap` or one day.
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: usize) -> Duration {
    const CEILING_SECS: f64 = 86_400.0;

    fn sane(value: f64, fallback: f64) -> f64 {
        if value.is_finite() && value >= 0.0 {
            value
        } else {
            fallback
        }
    }

    let factor = sane(backoff.factor, 1.0);
    let base_secs = sane(backoff.base.as_secs_f64(), 0.0);
    let max = sane(backoff.cap.as_secs_f64(), CEILING_SECS).min(CEILING_SECS);

    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = base_secs * factor.powi(exponent);
    let base = if raw.is_finite() { raw.clamp(0.0, max) } else { max };

    let mut delay = Duration::from_secs_f64(base);
    if backoff.jitter {
        delay += delay.mul_f64(rand::rng().random_range(0.0..=0.25));
    }
    delay.min(Duration::from_secs_f64(max))
}
