#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Declarative REST invocation core for `ModKit`
//!
//! Interface methods are declared once as [`MethodSpec`]s. A [`RestProxy`]
//! parses them into [`MethodDescriptor`]s and invokes them over a
//! [`RestClient`]:
//!
//! - requests are built from the descriptor and the call arguments
//!   (path, query, headers, body with `Content-Type` inference)
//! - the client pipeline adds `User-Agent`, `x-request-id`, an optional
//!   base URL override, configured headers, retries with backoff, a fresh
//!   `x-attempt-id` per attempt and a traffic log with header redaction
//! - responses are materialized into the declared return shape, or into
//!   the declared exception for unexpected statuses (a GET answered with 404
//!   yields an absent value instead)
//! - methods run natively async, blocking, or through an [`AsyncHandle`]
//!   with cancellation and callbacks; long-running operations are polled
//!   to their terminal response
//!
//! # Example
//!
//! ```ignore
//! use modkit_rest::{MethodSpec, RestClient, RestProxy, ReturnType, ServiceInterface};
//! use http::Method;
//!
//! let items = ServiceInterface::new("Items").method(
//!     MethodSpec::new("getItem", Method::GET, "/items/{id}")
//!         .path_param("id")
//!         .returns(ReturnType::value::<Item>()),
//! );
//!
//! let client = RestClient::builder("https://api.example.com/v1")
//!     .user_agent("inventory/1.0")
//!     .build()?;
//! let proxy = RestProxy::new(&items, client)?;
//!
//! let item: Option<Item> = proxy.invoke("getItem", &["42".into()]).await?.into_option()?;
//! ```

mod args;
mod builder;
mod client;
mod codec;
mod config;
mod descriptor;
mod error;
mod exception;
mod handle;
pub mod layers;
mod materialize;
mod poll;
mod proxy;
mod request;
mod response;
pub mod security;
mod template;
mod tls;
mod transport;

pub use args::Arg;
pub use builder::{AuthLayer, RestClientBuilder};
pub use client::RestClient;
pub use codec::{BodyCodec, JsonCodec};
pub use config::{
    DEFAULT_USER_AGENT, ExponentialBackoff, IDEMPOTENCY_KEY_HEADER, LogConfig, LogLevel,
    ProxyConfig, RestClientConfig, RetryConfig, RetryPolicy, RetryTrigger, TlsRootConfig,
    TransportSecurity, is_idempotent_method,
};
pub use descriptor::{
    Binding, CallMode, CollectionFormat, ExceptionSpec, ExpectedStatus, MethodDescriptor,
    MethodSpec, ReturnShape, ReturnType, ValueType,
};
pub use error::{BoxError, InvalidUriKind, RestError};
pub use exception::{DEFAULT_EXCEPTION, ErrorParts, ExceptionFactory, ExceptionRegistry, ServiceError};
pub use handle::{AsyncHandle, CallState, Subscription};
pub use materialize::{Materializer, Output};
pub use poll::{
    DEFAULT_MAX_POLLS, DEFAULT_POLL_INTERVAL, LocationPoller, OPERATION_LOCATION_HEADER,
    PollDecision, PollStrategy,
};
pub use proxy::{RestProxy, ServiceInterface};
pub use request::RequestDescriptor;
pub use response::{
    LimitedBody, ResponseBody, ResponseDescriptor, ResponseStream, full_body, parse_retry_after,
};
pub use template::PathTemplate;
pub use transport::TransportService;
