use http::HeaderMap;
use http::header::HeaderName;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// Default User-Agent string for REST invocations
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-rest/", env!("CARGO_PKG_VERSION"));

/// Header whose presence makes a non-idempotent call safe to repeat.
pub const IDEMPOTENCY_KEY_HEADER: HeaderName = HeaderName::from_static("idempotency-key");

/// Bytes read off a superseded response before the next attempt (64 KiB)
pub const DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT: usize = 64 * 1024;

/// Default number of body bytes the traffic log will print (16 KiB)
pub const DEFAULT_LOG_BODY_THRESHOLD: usize = 16 * 1024;

/// What went wrong with an attempt, as seen by a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RetryTrigger {
    /// The connection failed before a response arrived
    TransportError,
    /// The attempt ran past `request_timeout`
    Timeout,
    /// The server answered with this status
    Status(u16),
    /// Anything a retry cannot fix
    NonRetryable,
}

/// RFC 9110 idempotent methods; these are repeated without an idempotency key.
#[must_use]
pub fn is_idempotent_method(method: &http::Method) -> bool {
    use http::Method;
    [
        Method::GET,
        Method::HEAD,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
        Method::TRACE,
    ]
    .contains(method)
}

/// Delay schedule between attempts.
///
/// Retry `n` (0-based) waits `base * factor^n`, capped at `cap`. With
/// `jitter`, up to a quarter of the delay is added at random.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub cap: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

impl ExponentialBackoff {
    /// Doubling schedule from `base` up to `cap`, jittered.
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            factor: 2.0,
            jitter: true,
        }
    }

    /// Millisecond schedule without jitter, for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            jitter: false,
            ..Self::new(Duration::from_millis(1), Duration::from_millis(100))
        }
    }
}

/// Decides whether and when a failed attempt is repeated.
///
/// The retry stage of the pipeline consults the policy after every attempt.
/// [`RetryConfig`] is the stock implementation; callers with special needs
/// (e.g. a service that signals throttling through a custom status) install
/// their own via [`RestClientBuilder::retry_policy`](crate::RestClientBuilder::retry_policy).
pub trait RetryPolicy: fmt::Debug + Send + Sync {
    /// Maximum number of retries after the initial attempt.
    fn max_retries(&self) -> usize;

    /// Whether `trigger` warrants another attempt of a `method` request.
    fn should_retry(
        &self,
        trigger: RetryTrigger,
        method: &http::Method,
        has_idempotency_key: bool,
    ) -> bool;

    /// Delay before retry number `attempt + 1`.
    ///
    /// `retry_after` is the server's `Retry-After` hint, if any.
    fn backoff(&self, attempt: usize, retry_after: Option<Duration>) -> Duration;

    /// Whether the request carries a key that makes non-idempotent methods
    /// safe to retry.
    fn has_idempotency_key(&self, headers: &HeaderMap) -> bool {
        let _ = headers;
        false
    }

    /// Maximum bytes drained from a retried response; `None` skips draining.
    fn drain_limit(&self) -> Option<usize> {
        Some(DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT)
    }
}

/// Stock [`RetryPolicy`].
///
/// Triggers in `retry_any_method` are repeated for every method. Triggers in
/// `retry_idempotent` are repeated only for idempotent methods, or for any
/// method when the request carries the `idempotency_key` header.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub backoff: ExponentialBackoff,
    /// Default: 429
    pub retry_any_method: HashSet<RetryTrigger>,
    /// Default: transport errors, timeouts, 408, 500, 502, 503, 504
    pub retry_idempotent: HashSet<RetryTrigger>,
    /// Wait for the server's `Retry-After` instead of the backoff schedule
    pub honor_retry_after: bool,
    /// Bytes drained from a superseded response; `None` drops it unread
    /// and gives up the connection
    pub drain_limit: Option<usize>,
    pub idempotency_key: Option<HeaderName>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let retry_idempotent = [408, 500, 502, 503, 504]
            .into_iter()
            .map(RetryTrigger::Status)
            .chain([RetryTrigger::TransportError, RetryTrigger::Timeout])
            .collect();

        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
            retry_any_method: HashSet::from([RetryTrigger::Status(429)]),
            retry_idempotent,
            honor_retry_after: true,
            drain_limit: Some(DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT),
            idempotency_key: Some(IDEMPOTENCY_KEY_HEADER),
        }
    }
}

impl RetryConfig {
    /// A single attempt and no retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `max_retries` retries on the [`ExponentialBackoff::fast`] schedule.
    #[must_use]
    pub fn fast(max_retries: usize) -> Self {
        Self {
            max_retries,
            backoff: ExponentialBackoff::fast(),
            ..Self::default()
        }
    }
}

impl RetryPolicy for RetryConfig {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn should_retry(
        &self,
        trigger: RetryTrigger,
        method: &http::Method,
        has_idempotency_key: bool,
    ) -> bool {
        self.retry_any_method.contains(&trigger)
            || (self.retry_idempotent.contains(&trigger)
                && (has_idempotency_key || is_idempotent_method(method)))
    }

    fn backoff(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        retry_after
            .filter(|_| self.honor_retry_after)
            .unwrap_or_else(|| crate::layers::calculate_backoff(&self.backoff, attempt))
    }

    fn has_idempotency_key(&self, headers: &HeaderMap) -> bool {
        self.idempotency_key
            .as_ref()
            .is_some_and(|name| headers.contains_key(name))
    }

    fn drain_limit(&self) -> Option<usize> {
        self.drain_limit
    }
}

/// Where server certificates are verified against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Bundled Mozilla roots
    #[default]
    WebPki,
    /// The platform certificate store
    Native,
}

/// Which URL schemes the transport accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportSecurity {
    /// `https` only
    #[default]
    TlsOnly,
    /// `http` too; meant for mock servers
    AllowInsecureHttp,
}

/// HTTP CONNECT proxy the transport tunnels through.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy URI, e.g. `http://proxy.internal:3128`
    pub uri: String,
    /// Basic-auth user name for `Proxy-Authorization`
    pub username: Option<String>,
    /// Basic-auth password; never printed by `Debug`
    pub password: Option<SecretString>,
}

impl ProxyConfig {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            username: None,
            password: None,
        }
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::from(password.into()));
        self
    }
}

/// How much of each exchange the traffic log prints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// No traffic logging
    #[default]
    None,
    /// Verb, URL, status and elapsed time
    Basic,
    /// `Basic` plus request and response headers
    Headers,
    /// `Basic` plus request and response bodies
    Body,
    /// Everything
    BodyAndHeaders,
}

impl LogLevel {
    #[must_use]
    pub fn logs_headers(self) -> bool {
        matches!(self, Self::Headers | Self::BodyAndHeaders)
    }

    #[must_use]
    pub fn logs_body(self) -> bool {
        matches!(self, Self::Body | Self::BodyAndHeaders)
    }
}

/// Traffic log configuration.
///
/// Deserializable from module configuration:
///
/// ```yaml
/// log:
///   level: body_and_headers
///   body_threshold: 4096
///   pretty_json: true
///   redacted_headers: ["x-api-key"]
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Bodies longer than this many bytes are truncated in the log
    pub body_threshold: usize,
    /// Re-indent JSON bodies before printing
    pub pretty_json: bool,
    /// Extra header names masked in addition to the built-in sensitive set
    pub redacted_headers: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::None,
            body_threshold: DEFAULT_LOG_BODY_THRESHOLD,
            pretty_json: false,
            redacted_headers: Vec::new(),
        }
    }
}

/// Overall REST client configuration
///
/// Frozen once the client is built; use [`RestClient::derive`](crate::RestClient::derive)
/// to obtain an independently configurable copy.
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// Base URL every path template is resolved against
    pub base_url: String,

    /// Per-attempt timeout (default: 30 seconds)
    pub request_timeout: Duration,

    /// TCP connect timeout (default: 10 seconds)
    pub connect_timeout: Option<Duration>,

    /// Deadline for the whole call, attempts and backoffs included
    ///
    /// Enforced with or without retries; past it the call fails with
    /// `RestError::DeadlineExceeded`.
    pub total_timeout: Option<Duration>,

    /// Cap on bytes read from one response body (default: 10 MB)
    pub max_body_size: usize,

    pub user_agent: String,

    /// `None` turns retries off
    pub retry: Option<RetryConfig>,

    pub transport: TransportSecurity,

    pub tls_roots: TlsRootConfig,

    /// Optional HTTP CONNECT proxy
    pub proxy: Option<ProxyConfig>,

    /// Traffic log configuration
    pub log: LogConfig,

    /// Headers merged into every request that does not already carry them
    pub custom_headers: HeaderMap,

    /// Redirects every request to this scheme + authority + path prefix
    pub base_url_override: Option<String>,

    /// Calls queued ahead of the pipeline before new ones fail with
    /// `RestError::Overloaded` (default: 1024)
    pub buffer_capacity: usize,

    /// Idle pooled connections are closed after this long (default: 90 s)
    pub pool_idle_timeout: Option<Duration>,

    /// Idle connections kept per host (default: 32)
    pub pool_max_idle_per_host: usize,
}

impl Default for RestClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Some(Duration::from_secs(10)),
            total_timeout: None,
            max_body_size: 10 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            retry: Some(RetryConfig::default()),
            transport: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::default(),
            proxy: None,
            log: LogConfig::default(),
            custom_headers: HeaderMap::new(),
            base_url_override: None,
            buffer_capacity: 1024,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

impl RestClientConfig {
    /// Minimal configuration (no retry, small timeout)
    #[must_use]
    pub fn minimal(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(10),
            max_body_size: 1024 * 1024,
            retry: None,
            buffer_capacity: 256,
            pool_idle_timeout: Some(Duration::from_secs(30)),
            pool_max_idle_per_host: 8,
            ..Default::default()
        }
    }

    /// Configuration for tests against local mock servers (allows insecure HTTP)
    #[must_use]
    pub fn for_testing(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(10),
            max_body_size: 1024 * 1024,
            retry: None,
            transport: TransportSecurity::AllowInsecureHttp,
            buffer_capacity: 256,
            pool_idle_timeout: Some(Duration::from_secs(10)),
            pool_max_idle_per_host: 4,
            ..Default::default()
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_is_idempotent_method() {
        assert!(is_idempotent_method(&http::Method::GET));
        assert!(is_idempotent_method(&http::Method::PUT));
        assert!(is_idempotent_method(&http::Method::DELETE));
        assert!(!is_idempotent_method(&http::Method::POST));
        assert!(!is_idempotent_method(&http::Method::PATCH));
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_any_method.len(), 1);
        assert!(config.retry_any_method.contains(&RetryTrigger::Status(429)));
        assert_eq!(config.retry_idempotent.len(), 7);
        assert_eq!(config.drain_limit(), Some(DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT));
    }

    #[test]
    fn test_should_retry_respects_method_and_key() {
        let config = RetryConfig::default();
        let trigger = RetryTrigger::Status(503);

        assert!(config.should_retry(trigger, &http::Method::GET, false));
        assert!(!config.should_retry(trigger, &http::Method::POST, false));
        assert!(config.should_retry(trigger, &http::Method::POST, true));
        // 429 always retries
        assert!(config.should_retry(RetryTrigger::Status(429), &http::Method::POST, false));
        assert!(!config.should_retry(RetryTrigger::NonRetryable, &http::Method::GET, true));
    }

    #[test]
    fn test_idempotency_key_detection() {
        let config = RetryConfig::default();
        let mut headers = HeaderMap::new();
        assert!(!config.has_idempotency_key(&headers));

        headers.insert(IDEMPOTENCY_KEY_HEADER, "abc".parse().unwrap());
        assert!(config.has_idempotency_key(&headers));

        let no_key = RetryConfig {
            idempotency_key: None,
            ..RetryConfig::default()
        };
        assert!(!no_key.has_idempotency_key(&headers));
    }

    #[test]
    fn test_backoff_prefers_retry_after() {
        let config = RetryConfig::fast(2);
        assert_eq!(
            config.backoff(0, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(config.backoff(0, None), Duration::from_millis(1));

        let ignoring = RetryConfig {
            honor_retry_after: false,
            ..RetryConfig::fast(2)
        };
        assert_eq!(
            ignoring.backoff(1, Some(Duration::from_secs(3))),
            Duration::from_millis(2)
        );
    }

    #[test]
    fn test_drain_can_be_disabled() {
        let config = RetryConfig {
            drain_limit: None,
            ..RetryConfig::default()
        };
        assert_eq!(config.drain_limit(), None);
    }

    #[test]
    fn test_log_config_deserializes_snake_case_levels() {
        let config: LogConfig = serde_json::from_value(serde_json::json!({
            "level": "body_and_headers",
            "pretty_json": true
        }))
        .unwrap();

        assert_eq!(config.level, LogLevel::BodyAndHeaders);
        assert!(config.level.logs_body());
        assert!(config.level.logs_headers());
        assert!(config.pretty_json);
        assert_eq!(config.body_threshold, DEFAULT_LOG_BODY_THRESHOLD);
    }

    #[test]
    fn test_log_config_rejects_unknown_fields() {
        let result: Result<LogConfig, _> =
            serde_json::from_value(serde_json::json!({ "lvl": "basic" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_proxy_password_is_not_printed() {
        let proxy = ProxyConfig::new("http://proxy:3128").with_credentials("svc", "hunter2");

        let debug = format!("{proxy:?}");
        assert!(!debug.contains("hunter2"));
        assert_eq!(
            proxy.password.as_ref().map(ExposeSecret::expose_secret),
            Some("hunter2")
        );
    }

    #[test]
    fn test_for_testing_allows_http() {
        let config = RestClientConfig::for_testing("http://localhost:1");
        assert_eq!(config.transport, TransportSecurity::AllowInsecureHttp);
        assert!(config.retry.is_none());
        assert_eq!(config.base_url, "http://localhost:1");
    }
}
