//! Long-running operations: decide whether a response is terminal and,
//! if not, how to ask again.

use crate::client::RestClient;
use crate::error::{InvalidUriKind, RestError};
use crate::handle::{CallState, Progress};
use crate::request::RequestDescriptor;
use crate::response::{ResponseDescriptor, parse_retry_after};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::{HeaderName, Method, StatusCode};
use std::fmt;
use std::time::Duration;

/// Default wait between polls when the server sends no `Retry-After`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of follow-up requests before giving up.
pub const DEFAULT_MAX_POLLS: usize = 60;

/// Bytes read off a superseded response so its connection can be reused.
const SUPERSEDED_DRAIN_LIMIT: usize = 64 * 1024;

/// Status URL consulted when an accepted response has no `Location`.
pub const OPERATION_LOCATION_HEADER: HeaderName = HeaderName::from_static("operation-location");

/// What to do after a response of a long-running operation.
#[derive(Debug)]
pub enum PollDecision {
    /// The response is the final result
    Terminal,
    /// Send `request` after `delay`; the current response is superseded
    Continue {
        request: RequestDescriptor,
        delay: Duration,
    },
}

/// Strategy for driving a long-running operation to completion.
pub trait PollStrategy: fmt::Debug + Send + Sync {
    /// Upper bound on follow-up requests.
    fn max_polls(&self) -> usize;

    /// Inspect `response` to the operation started by `origin`.
    ///
    /// # Errors
    ///
    /// Returns an error if the next poll request cannot be formed.
    fn next(
        &self,
        origin: &RequestDescriptor,
        response: &ResponseDescriptor,
    ) -> Result<PollDecision, RestError>;
}

/// Polls while the server answers `202 Accepted`.
///
/// Each poll is a GET of the `Location` header, else `Operation-Location`,
/// else the original URL. Relative locations resolve against the original
/// URL. The wait honours `Retry-After` and falls back to `interval`.
#[derive(Debug, Clone)]
pub struct LocationPoller {
    interval: Duration,
    max_polls: usize,
}

impl LocationPoller {
    #[must_use]
    pub fn new(interval: Duration, max_polls: usize) -> Self {
        Self {
            interval,
            max_polls,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for LocationPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_POLLS)
    }
}

impl PollStrategy for LocationPoller {
    fn max_polls(&self) -> usize {
        self.max_polls
    }

    fn next(
        &self,
        origin: &RequestDescriptor,
        response: &ResponseDescriptor,
    ) -> Result<PollDecision, RestError> {
        if response.status() != StatusCode::ACCEPTED {
            return Ok(PollDecision::Terminal);
        }

        let headers = response.headers();
        let location = headers
            .get(LOCATION)
            .or_else(|| headers.get(OPERATION_LOCATION_HEADER))
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let url = match location {
            Some(location) => resolve(&origin.url, location)?,
            None => origin.url.clone(),
        };

        let mut poll_headers = origin.headers.clone();
        poll_headers.remove(CONTENT_TYPE);
        poll_headers.remove(CONTENT_LENGTH);

        Ok(PollDecision::Continue {
            request: RequestDescriptor {
                method: Method::GET,
                url,
                headers: poll_headers,
                body: None,
            },
            delay: parse_retry_after(headers).unwrap_or(self.interval),
        })
    }
}

fn resolve(base: &str, location: &str) -> Result<String, RestError> {
    let invalid = |reason: String| RestError::InvalidUri {
        url: location.to_owned(),
        kind: InvalidUriKind::ParseError,
        reason,
    };
    let base = url::Url::parse(base).map_err(|e| invalid(format!("invalid operation URL: {e}")))?;
    base.join(location)
        .map(String::from)
        .map_err(|e| invalid(e.to_string()))
}

/// Drive `response` to a terminal response.
///
/// Superseded responses are drained and dropped; only the terminal one is
/// returned.
pub(crate) async fn poll_to_terminal(
    client: &RestClient,
    strategy: &dyn PollStrategy,
    origin: &RequestDescriptor,
    mut response: ResponseDescriptor,
    progress: &Progress,
) -> Result<ResponseDescriptor, RestError> {
    let mut polls = 0;
    loop {
        let (request, delay) = match strategy.next(origin, &response)? {
            PollDecision::Terminal => return Ok(response),
            PollDecision::Continue { request, delay } => (request, delay),
        };
        response.discard(SUPERSEDED_DRAIN_LIMIT).await;

        if polls >= strategy.max_polls() {
            tracing::debug!(polls, url = %origin.url, "long-running operation did not finish");
            return Err(RestError::PollingExhausted { polls });
        }
        polls += 1;
        progress.set(CallState::Polling { polls });

        tracing::trace!(
            polls,
            url = %request.url,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "polling long-running operation"
        );
        tokio::time::sleep(delay).await;
        response = client.send(request).await?;
    }
}
