use crate::builder::{AuthLayer, RestClientBuilder};
use crate::config::{RestClientConfig, RetryPolicy};
use crate::error::RestError;
use crate::request::RequestDescriptor;
use crate::response::{ResponseBody, ResponseDescriptor};
use crate::transport::TransportService;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tower::Service;
use tower::buffer::Buffer;

/// Future type of the type-erased pipeline
pub type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, RestError>> + Send>>;

/// The pipeline behind its request buffer
pub type BufferedService = Buffer<Request<Full<Bytes>>, ServiceFuture>;

/// Frozen REST transport: a tower pipeline plus the configuration it was
/// built from.
///
/// `RestClient` is `Clone + Send + Sync`; clones share the pipeline and the
/// connection pool. The configuration cannot change after `build()`; use
/// [`derive`](Self::derive) for a differently configured client.
#[derive(Clone)]
pub struct RestClient {
    pub(crate) service: BufferedService,
    pub(crate) config: Arc<RestClientConfig>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) auth_layer: Option<AuthLayer>,
    pub(crate) transport: Option<Arc<Mutex<TransportService>>>,
    pub(crate) runtime: tokio::runtime::Handle,
}

impl RestClient {
    /// Start building a client for `base_url`
    #[must_use]
    pub fn builder(base_url: impl Into<String>) -> RestClientBuilder {
        RestClientBuilder::new(base_url)
    }

    #[must_use]
    pub fn config(&self) -> &RestClientConfig {
        &self.config
    }

    /// Base URL every path template is resolved against
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Runtime the client was built on; blocking and spawned calls run here.
    #[must_use]
    pub fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }

    /// Builder over a deep copy of this client's configuration.
    ///
    /// Changes made to the returned builder never affect this client. The
    /// credential layer, retry policy and injected transport carry over.
    #[must_use]
    pub fn derive(&self) -> RestClientBuilder {
        let mut builder = RestClientBuilder::with_config(RestClientConfig::clone(&self.config));
        builder.retry_policy = self.retry_policy.clone();
        builder.auth_layer = self.auth_layer.clone();
        builder.transport = self.transport.as_ref().map(|shared| {
            shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        });
        builder
    }

    /// Send a built request through the pipeline.
    ///
    /// Every HTTP status is returned as `Ok`; only transport-level failures
    /// are errors.
    ///
    /// # Errors
    ///
    /// Returns `RestError` if the URL is invalid for the transport security
    /// mode, the request buffer is full (`Overloaded`), or the transport fails
    /// after all retries.
    pub async fn send(&self, request: RequestDescriptor) -> Result<ResponseDescriptor, RestError> {
        let request = request.into_http(self.config.transport)?;

        let mut service = self.service.clone();
        try_acquire_buffer_slot(&mut service).await?;
        let response = service.call(request).await.map_err(map_buffer_error)?;

        Ok(ResponseDescriptor::new(response, self.config.max_body_size))
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Map buffer errors back to `RestError`.
///
/// Errors raised by the pipeline pass through; anything else means the
/// buffer worker is gone.
pub fn map_buffer_error(err: tower::BoxError) -> RestError {
    match err.downcast::<RestError>() {
        Ok(rest) => *rest,
        Err(err) => {
            tracing::error!(
                error = %err,
                "buffer worker closed unexpectedly; service unavailable"
            );
            RestError::ServiceClosed
        }
    }
}

/// Try to acquire a buffer slot with fail-fast semantics.
///
/// If the buffer is full, returns `RestError::Overloaded` immediately instead
/// of blocking.
pub async fn try_acquire_buffer_slot(service: &mut BufferedService) -> Result<(), RestError> {
    use std::task::Poll;

    let poll_result = std::future::poll_fn(|cx| match service.poll_ready(cx) {
        Poll::Ready(result) => Poll::Ready(Some(result)),
        Poll::Pending => Poll::Ready(None),
    })
    .await;

    match poll_result {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(map_buffer_error(e)),
        None => Err(RestError::Overloaded),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, TransportSecurity};
    use crate::layers::test_support::{RecordingService, response};
    use crate::layers::{ATTEMPT_ID_HEADER, REQUEST_ID_HEADER};
    use httpmock::prelude::*;
    use tower::ServiceExt;

    fn test_client(base_url: &str) -> RestClient {
        RestClientBuilder::with_config(RestClientConfig::for_testing(base_url))
            .build()
            .unwrap()
    }

    fn scripted(recorder: &RecordingService) -> RestClientBuilder {
        RestClientBuilder::with_config(RestClientConfig::for_testing("http://svc.local"))
            .with_transport(recorder.clone().boxed_clone())
    }

    #[tokio::test]
    async fn test_send_get() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(Method::GET)
                .path("/items/7")
                .header_exists("user-agent")
                .header_exists(REQUEST_ID_HEADER.as_str())
                .header_exists(ATTEMPT_ID_HEADER.as_str());
            then.status(200).body("widget");
        });

        let client = test_client(&server.base_url());
        let request = RequestDescriptor::new(http::Method::GET, server.url("/items/7"));
        let resp = client.send(request).await.unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "widget");
        mock.assert();
    }

    #[tokio::test]
    async fn test_send_returns_error_statuses_as_responses() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(Method::DELETE).path("/items/7");
            then.status(500).body("boom");
        });

        let client = test_client(&server.base_url());
        let resp = client
            .send(RequestDescriptor::new(http::Method::DELETE, server.url("/items/7")))
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
    }

    #[tokio::test]
    async fn test_send_rejects_http_when_tls_only() {
        let client = RestClientBuilder::new("http://svc.local")
            .transport_security(TransportSecurity::TlsOnly)
            .build()
            .unwrap();
        let err = client
            .send(RequestDescriptor::new(http::Method::GET, "http://svc.local/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::InvalidScheme { .. }));
    }

    #[tokio::test]
    async fn test_caller_user_agent_wins() {
        let recorder = RecordingService::ok();
        let client = scripted(&recorder).user_agent("framework/1.0").build().unwrap();

        let request = RequestDescriptor::new(http::Method::GET, "http://svc.local/a")
            .with_header("user-agent", "caller/2.0")
            .unwrap();
        client.send(request).await.unwrap();
        client
            .send(RequestDescriptor::new(http::Method::GET, "http://svc.local/b"))
            .await
            .unwrap();

        assert_eq!(recorder.header(0, "user-agent").as_deref(), Some("caller/2.0"));
        assert_eq!(recorder.header(1, "user-agent").as_deref(), Some("framework/1.0"));
    }

    #[tokio::test]
    async fn test_custom_headers_merged_without_overwrite() {
        let recorder = RecordingService::ok();
        let client = scripted(&recorder)
            .custom_header("x-tenant", "default")
            .custom_header("x-region", "eu")
            .build()
            .unwrap();

        let request = RequestDescriptor::new(http::Method::GET, "http://svc.local/a")
            .with_header("x-tenant", "acme")
            .unwrap();
        client.send(request).await.unwrap();

        assert_eq!(recorder.header(0, "x-tenant").as_deref(), Some("acme"));
        assert_eq!(recorder.header(0, "x-region").as_deref(), Some("eu"));
    }

    #[tokio::test]
    async fn test_base_url_override_redirects_requests() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(Method::GET).path("/gateway/items/7");
            then.status(204);
        });

        let client = RestClientBuilder::with_config(RestClientConfig::for_testing(
            "https://api.example.com",
        ))
        .base_url_override(server.url("/gateway"))
        .build()
        .unwrap();

        let resp = client
            .send(RequestDescriptor::new(http::Method::GET, "https://api.example.com/items/7"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);
        mock.assert();
    }

    #[tokio::test]
    async fn test_retries_share_request_id_with_fresh_attempt_ids() {
        let recorder = RecordingService::statuses(&[503, 503, 200]);
        let client = scripted(&recorder)
            .retry(Some(RetryConfig::fast(3)))
            .build()
            .unwrap();

        let resp = client
            .send(RequestDescriptor::new(http::Method::GET, "http://svc.local/items"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(recorder.calls(), 3);

        let request_ids: Vec<_> = (0..3)
            .map(|n| recorder.header(n, REQUEST_ID_HEADER.as_str()).unwrap())
            .collect();
        let attempt_ids: std::collections::HashSet<_> = (0..3)
            .map(|n| recorder.header(n, ATTEMPT_ID_HEADER.as_str()).unwrap())
            .collect();
        assert!(request_ids.iter().all(|id| id == &request_ids[0]));
        assert_eq!(attempt_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_auth_layer_runs_per_attempt() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let recorder = RecordingService::statuses(&[500, 200]);
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let client = scripted(&recorder)
            .retry(Some(RetryConfig::fast(2)))
            .with_auth_layer(move |inner| {
                let seen = Arc::clone(&seen);
                inner
                    .map_request(move |mut req: Request<Full<Bytes>>| {
                        let n = seen.fetch_add(1, Ordering::SeqCst);
                        req.headers_mut().insert(
                            http::header::AUTHORIZATION,
                            format!("Bearer token-{n}").parse().unwrap(),
                        );
                        req
                    })
                    .boxed_clone()
            })
            .build()
            .unwrap();

        client
            .send(RequestDescriptor::new(http::Method::GET, "http://svc.local/secure"))
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.header(0, "authorization").as_deref(), Some("Bearer token-0"));
        assert_eq!(recorder.header(1, "authorization").as_deref(), Some("Bearer token-1"));
    }

    #[tokio::test]
    async fn test_derive_is_independent() {
        let recorder = RecordingService::ok();
        let original = scripted(&recorder).user_agent("original/1.0").build().unwrap();

        let derived = original.derive().user_agent("derived/1.0").build().unwrap();
        assert_eq!(original.config().user_agent, "original/1.0");
        assert_eq!(derived.config().user_agent, "derived/1.0");

        derived
            .send(RequestDescriptor::new(http::Method::GET, "http://svc.local/a"))
            .await
            .unwrap();
        original
            .send(RequestDescriptor::new(http::Method::GET, "http://svc.local/b"))
            .await
            .unwrap();

        assert_eq!(recorder.header(0, "user-agent").as_deref(), Some("derived/1.0"));
        assert_eq!(recorder.header(1, "user-agent").as_deref(), Some("original/1.0"));
    }

    #[tokio::test]
    async fn test_total_timeout_applies_without_retry() {
        let slow = tower::service_fn(|_req: Request<Full<Bytes>>| async {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            Ok::<_, RestError>(response(200, "late"))
        });
        let client = RestClientBuilder::with_config(RestClientConfig::for_testing("http://svc.local"))
            .retry(None)
            .total_timeout(std::time::Duration::from_millis(50))
            .with_transport(slow.boxed_clone())
            .build()
            .unwrap();

        let err = client
            .send(RequestDescriptor::new(http::Method::GET, "http://svc.local/slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn test_buffer_overflow_returns_overloaded() {
        let slow = RecordingService::with(|_, _| Ok(response(200, "ok")));
        let slow = tower::service_fn(move |req: Request<Full<Bytes>>| {
            let mut inner = slow.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                inner.call(req).await
            }
        });

        let config = RestClientConfig {
            buffer_capacity: 1,
            ..RestClientConfig::for_testing("http://svc.local")
        };
        let client = RestClientBuilder::with_config(config)
            .with_transport(slow.boxed_clone())
            .build()
            .unwrap();

        let first = client.clone();
        let handle = tokio::spawn(async move {
            first
                .send(RequestDescriptor::new(http::Method::GET, "http://svc.local/slow"))
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let second = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            client.send(RequestDescriptor::new(http::Method::GET, "http://svc.local/slow")),
        )
        .await
        .expect("request should not wait for a buffer slot");
        match second {
            // timing dependent: the worker may already have taken the first request
            Err(RestError::Overloaded) | Ok(_) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }

        _ = handle.await;
    }

    #[test]
    fn test_map_buffer_error_passes_through_rest_error() {
        let boxed: tower::BoxError = Box::new(RestError::Timeout(std::time::Duration::from_secs(10)));
        assert!(matches!(map_buffer_error(boxed), RestError::Timeout(_)));
    }

    #[test]
    fn test_map_buffer_error_returns_service_closed_for_unknown_error() {
        let other: tower::BoxError = Box::new(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "buffer worker died",
        ));
        assert!(matches!(map_buffer_error(other), RestError::ServiceClosed));
    }

    #[test]
    fn test_rest_client_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RestClient>();
    }
}
