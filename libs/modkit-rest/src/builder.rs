use crate::config::{
    LogConfig, LogLevel, ProxyConfig, RestClientConfig, RetryConfig, RetryPolicy, TlsRootConfig,
    TransportSecurity,
};
use crate::error::RestError;
use crate::layers::{
    AttemptIdLayer, BaseUrlLayer, CustomHeadersLayer, LoggingLayer, RequestIdLayer, RetryLayer,
    UserAgentLayer,
};
use crate::transport::{self, TransportService};
use std::sync::Arc;
use std::time::Duration;
use tower::buffer::Buffer;
use tower::{ServiceBuilder, ServiceExt};

/// Wraps the per-attempt part of the pipeline with credentials.
///
/// Kept as a shared closure so [`RestClient::derive`](crate::RestClient::derive)
/// can re-apply it to the derived client's stack.
pub type AuthLayer = Arc<dyn Fn(TransportService) -> TransportService + Send + Sync>;

/// Builder for constructing a [`RestClient`](crate::RestClient) with its layered
/// tower pipeline.
pub struct RestClientBuilder {
    pub(crate) config: RestClientConfig,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) auth_layer: Option<AuthLayer>,
    pub(crate) transport: Option<TransportService>,
    deferred: Option<RestError>,
}

impl RestClientBuilder {
    /// Create a builder with default configuration for `base_url`
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_config(RestClientConfig {
            base_url: base_url.into(),
            ..RestClientConfig::default()
        })
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: RestClientConfig) -> Self {
        Self {
            config,
            retry_policy: None,
            auth_layer: None,
            transport: None,
            deferred: None,
        }
    }

    /// Configuration the client will be built with.
    #[must_use]
    pub fn config(&self) -> &RestClientConfig {
        &self.config
    }

    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    /// Set the per-attempt timeout
    ///
    /// Each retry attempt gets its own timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout (`None` waits for the OS)
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the total timeout spanning all retry attempts
    ///
    /// Exceeding it fails the call with `RestError::DeadlineExceeded`. Only
    /// enforced while the retry stage is enabled.
    #[must_use]
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.config.total_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Set the retry configuration (`None` disables the retry stage)
    #[must_use]
    pub fn retry(mut self, retry: Option<RetryConfig>) -> Self {
        self.config.retry = retry;
        self
    }

    /// Replace the retry decision logic with a custom policy.
    ///
    /// Takes precedence over [`retry`](Self::retry).
    #[must_use]
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Set transport security mode
    ///
    /// Use `TransportSecurity::AllowInsecureHttp` only for testing with mock servers.
    #[must_use]
    pub fn transport_security(mut self, transport: TransportSecurity) -> Self {
        self.config.transport = transport;
        self
    }

    /// Allow plain HTTP connections (for testing only)
    ///
    /// Only available in debug builds or with the `allow-insecure-http` feature.
    #[must_use]
    #[cfg(any(debug_assertions, feature = "allow-insecure-http"))]
    pub fn allow_insecure_http(mut self) -> Self {
        tracing::warn!(
            target: "modkit_rest::security",
            "allow_insecure_http() called - HTTP traffic will NOT be encrypted"
        );
        self.config.transport = TransportSecurity::AllowInsecureHttp;
        self
    }

    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.config.tls_roots = roots;
        self
    }

    /// Tunnel every connection through an HTTP CONNECT proxy
    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    #[must_use]
    pub fn log(mut self, log: LogConfig) -> Self {
        self.config.log = log;
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Add a header sent with every request that does not already carry it.
    ///
    /// Invalid names or values are reported by [`build`](Self::build).
    #[must_use]
    pub fn custom_header(mut self, name: &str, value: &str) -> Self {
        let parsed = http::HeaderName::from_bytes(name.as_bytes())
            .map_err(RestError::from)
            .and_then(|name| Ok((name, http::HeaderValue::from_str(value)?)));
        match parsed {
            Ok((name, value)) => {
                self.config.custom_headers.append(name, value);
            }
            Err(e) => {
                self.deferred.get_or_insert(e);
            }
        }
        self
    }

    /// Send every request to `url` (scheme, authority and path prefix)
    /// instead of the host it was built for.
    #[must_use]
    pub fn base_url_override(mut self, url: impl Into<String>) -> Self {
        self.config.base_url_override = Some(url.into());
        self
    }

    /// Set the buffer capacity for concurrent request handling
    ///
    /// Clamped to at least 1.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity.max(1);
        self
    }

    /// Set the idle connection timeout (`None` keeps idle connections)
    #[must_use]
    pub fn pool_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.config.pool_max_idle_per_host = max;
        self
    }

    /// Insert a credential layer between retry and attempt-id in the stack.
    ///
    /// Stack position: `… → Retry → **this layer** → AttemptId → …`
    ///
    /// The layer sits inside the retry loop so each attempt re-executes it
    /// (e.g. re-reads a refreshed bearer token). A second call replaces the
    /// first.
    #[must_use]
    pub fn with_auth_layer(
        mut self,
        wrap: impl Fn(TransportService) -> TransportService + Send + Sync + 'static,
    ) -> Self {
        self.auth_layer = Some(Arc::new(wrap));
        self
    }

    /// Replace the network transport with an arbitrary service.
    ///
    /// Every other stage, including timeout and decompression, still applies.
    /// Mostly useful for tests.
    #[must_use]
    pub fn with_transport(mut self, transport: TransportService) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the client with all configured layers
    ///
    /// Must be called within a tokio runtime; the client keeps a handle to it
    /// for blocking and spawned calls.
    ///
    /// # Errors
    /// Returns an error if no runtime is available, TLS initialization fails
    /// or configuration is invalid.
    pub fn build(self) -> Result<crate::RestClient, RestError> {
        let runtime = tokio::runtime::Handle::try_current()?;

        if let Some(err) = self.deferred {
            return Err(err);
        }

        if self.config.transport == TransportSecurity::AllowInsecureHttp {
            tracing::warn!(
                "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
                 use only for testing with mock servers"
            );
        }

        // =======================================================================
        // Tower Layer Stack (outer to inner)
        // =======================================================================
        //
        //   Buffer → UserAgent → RequestId → BaseUrl → CustomHeaders →
        //   Retry → [AuthLayer?] → AttemptId → Logging → Timeout →
        //   Decompression → hyper_client (or injected transport)
        //
        // Logging is network-adjacent so every physical attempt is logged
        // with the headers that actually went out.
        // =======================================================================
        let base = match &self.transport {
            Some(injected) => transport::finish_transport(injected.clone(), self.config.request_timeout),
            None => transport::network_transport(&self.config)?,
        };

        let mut service = ServiceBuilder::new()
            .layer(AttemptIdLayer)
            .layer(
                LoggingLayer::new(self.config.log.clone())
                    .with_preview_timeout(self.config.request_timeout),
            )
            .service(base)
            .boxed_clone();

        if let Some(wrap) = &self.auth_layer {
            service = wrap(service);
        }

        let policy = self.retry_policy.clone().or_else(|| {
            self.config
                .retry
                .clone()
                .map(|retry| Arc::new(retry) as Arc<dyn RetryPolicy>)
        });
        // the total deadline holds even with retries off: a single attempt
        let policy = policy.or_else(|| {
            self.config
                .total_timeout
                .map(|_| Arc::new(RetryConfig::disabled()) as Arc<dyn RetryPolicy>)
        });
        if let Some(policy) = policy {
            let retry_layer = RetryLayer::with_total_timeout(policy, self.config.total_timeout);
            service = ServiceBuilder::new()
                .layer(retry_layer)
                .service(service)
                .boxed_clone();
        }

        let base_url = match &self.config.base_url_override {
            Some(url) => BaseUrlLayer::try_new(url)?,
            None => BaseUrlLayer::passthrough(),
        };
        service = ServiceBuilder::new()
            .layer(UserAgentLayer::try_new(&self.config.user_agent)?)
            .layer(RequestIdLayer)
            .layer(base_url)
            .layer(CustomHeadersLayer::new(self.config.custom_headers.clone()))
            .service(service)
            .boxed_clone();

        // tower::Buffer panics with capacity 0
        let buffered: crate::client::BufferedService =
            Buffer::new(service, self.config.buffer_capacity.max(1));

        Ok(crate::RestClient {
            service: buffered,
            config: Arc::new(self.config),
            retry_policy: self.retry_policy,
            auth_layer: self.auth_layer,
            transport: self.transport.map(|t| Arc::new(std::sync::Mutex::new(t))),
            runtime,
        })
    }
}

impl std::fmt::Debug for RestClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClientBuilder")
            .field("config", &self.config)
            .field("retry_policy", &self.retry_policy)
            .field("auth_layer", &self.auth_layer.is_some())
            .field("transport", &self.transport.is_some())
            .field("deferred", &self.deferred)
            .finish()
    }
}
