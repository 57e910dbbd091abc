//! Tower layers that make up the transport pipeline
//!
//! Order from the caller towards the network:
//!
//! - [`UserAgentLayer`] - default `User-Agent`
//! - [`RequestIdLayer`] - logical call id, shared by all attempts
//! - [`BaseUrlLayer`] - optional endpoint override
//! - [`CustomHeadersLayer`] - configured headers, never overwriting
//! - [`RetryLayer`] - policy-driven retry with backoff and jitter
//! - [`AttemptIdLayer`] - fresh id for every physical attempt
//! - [`LoggingLayer`] - traffic log with header redaction

mod base_url;
mod custom_headers;
mod logging;
mod request_id;
mod retry;
mod user_agent;

#[cfg(test)]
pub(crate) mod test_support;

pub use base_url::{BaseUrlLayer, BaseUrlService};
pub use custom_headers::{CustomHeadersLayer, CustomHeadersService};
pub use logging::{DEFAULT_PREVIEW_TIMEOUT, LoggingLayer, LoggingService, TRAFFIC_TARGET};
pub(crate) use request_id::fresh_id;
pub use request_id::{
    ATTEMPT_ID_HEADER, AttemptIdLayer, AttemptIdService, REQUEST_ID_HEADER, RequestIdLayer,
    RequestIdService,
};
pub use retry::{RETRY_ATTEMPT_HEADER, RetryLayer, RetryService, calculate_backoff};
pub use user_agent::{UserAgentLayer, UserAgentService};
