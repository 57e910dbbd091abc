//! Innermost pipeline stages: per-attempt timeout, transparent
//! decompression and the pooled hyper/rustls connection layer.

use crate::config::{ProxyConfig, RestClientConfig, TransportSecurity};
use crate::error::{BoxError, InvalidUriKind, RestError};
use crate::response::ResponseBody;
use crate::tls;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use secrecy::ExposeSecret;
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

/// Type-erased service between pipeline stages.
pub type TransportService =
    BoxCloneService<Request<Full<Bytes>>, Response<ResponseBody>, RestError>;

/// Build the network transport described by `config`.
///
/// # Errors
///
/// Returns `RestError::Tls` if TLS roots cannot be loaded, or an URI/header
/// error if the proxy settings are invalid.
pub(crate) fn network_transport(config: &RestClientConfig) -> Result<TransportService, RestError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(config.connect_timeout);

    let tls = tls::https_connector_builder(config.tls_roots)?;
    let tls = if config.transport == TransportSecurity::AllowInsecureHttp {
        tls.https_or_http()
    } else {
        tls.https_only()
    };
    let tls = tls.enable_all_versions();

    let transport = match &config.proxy {
        None => finish_transport(pooled_client(config, tls.wrap_connector(http)), config.request_timeout),
        Some(proxy) => {
            tracing::debug!(proxy = %proxy.uri, "tunnelling through HTTP proxy");
            let tunnel = proxy_tunnel(proxy, http)?;
            finish_transport(pooled_client(config, tls.wrap_connector(tunnel)), config.request_timeout)
        }
    };
    Ok(transport)
}

fn pooled_client<C>(config: &RestClientConfig, connector: C) -> Client<C, Full<Bytes>>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    let mut builder = Client::builder(TokioExecutor::new());
    // pool_idle_timeout is ignored without a pool timer
    builder
        .pool_timer(TokioTimer::new())
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .http2_only(false);
    if let Some(idle) = config.pool_idle_timeout {
        builder.pool_idle_timeout(idle);
    }
    builder.build(connector)
}

/// CONNECT tunnel through `proxy`, with Basic proxy credentials if configured.
fn proxy_tunnel(proxy: &ProxyConfig, http: HttpConnector) -> Result<Tunnel<HttpConnector>, RestError> {
    let uri: Uri = proxy
        .uri
        .parse()
        .map_err(|e: http::uri::InvalidUri| RestError::InvalidUri {
            url: proxy.uri.clone(),
            kind: InvalidUriKind::ParseError,
            reason: e.to_string(),
        })?;

    let tunnel = Tunnel::new(uri, http);
    let Some(user) = &proxy.username else {
        return Ok(tunnel);
    };

    let password = proxy
        .password
        .as_ref()
        .map(ExposeSecret::expose_secret)
        .unwrap_or_default();
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
    let mut value = HeaderValue::from_str(&format!("Basic {token}"))?;
    value.set_sensitive(true);
    Ok(tunnel.with_auth(value))
}

/// Wrap a raw transport with the per-attempt timeout and decompression and
/// erase its types.
///
/// Used both for the hyper client and for transports injected with
/// [`RestClientBuilder::with_transport`](crate::RestClientBuilder::with_transport).
pub(crate) fn finish_transport<S, B>(transport: S, timeout: Duration) -> TransportService
where
    S: Service<Request<Full<Bytes>>, Response = Response<B>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError> + Send + Sync,
{
    ServiceBuilder::new()
        .layer(TimeoutLayer::new(timeout))
        .layer(DecompressionLayer::new())
        .service(transport)
        .map_response(box_response_body)
        .map_err(move |e: BoxError| map_tower_error(e, timeout))
        .boxed_clone()
}

/// Map tower errors to `RestError`, keeping typed errors raised further in.
pub(crate) fn map_tower_error(err: BoxError, timeout: Duration) -> RestError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return RestError::Timeout(timeout);
    }
    match err.downcast::<RestError>() {
        Ok(rest) => *rest,
        Err(other) => RestError::Transport(other),
    }
}

fn box_response_body<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError> + Send + Sync,
{
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::layers::test_support::{RecordingService, get, response};
    use std::io::Write;

    #[test]
    fn test_map_tower_error_keeps_rest_error() {
        let err = map_tower_error(Box::new(RestError::Overloaded), Duration::from_secs(1));
        assert!(matches!(err, RestError::Overloaded));
    }

    #[test]
    fn test_map_tower_error_wraps_foreign_error() {
        let err = map_tower_error("boom".into(), Duration::from_secs(1));
        assert!(matches!(err, RestError::Transport(_)));
    }

    #[tokio::test]
    async fn test_injected_transport_times_out() {
        let slow = RecordingService::with(|_, _| Ok(response(200, "")));
        let slow = tower::service_fn(move |req: Request<Full<Bytes>>| {
            let mut inner = slow.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                inner.call(req).await
            }
        });

        let svc = finish_transport(slow, Duration::from_millis(20));
        let err = svc.oneshot(get("http://example.com/")).await.unwrap_err();
        assert!(matches!(err, RestError::Timeout(d) if d == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_gzip_response_decompressed() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(br#"{"name":"widget"}"#).unwrap();
        let compressed = Bytes::from(encoder.finish().unwrap());

        let recorder = RecordingService::with(move |_, _| {
            Ok(Response::builder()
                .status(200)
                .header("content-encoding", "gzip")
                .body(crate::response::full_body(compressed.clone()))
                .unwrap())
        });

        let svc = finish_transport(recorder.clone(), Duration::from_secs(5));
        let resp = svc.oneshot(get("http://example.com/")).await.unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();

        assert_eq!(body, br#"{"name":"widget"}"#.as_slice());
        assert!(recorder.header(0, "accept-encoding").is_some());
    }

    #[test]
    fn test_proxy_with_credentials_accepted() {
        let proxy = ProxyConfig::new("http://proxy.internal:3128").with_credentials("svc", "pw");
        assert!(proxy_tunnel(&proxy, HttpConnector::new()).is_ok());
    }

    #[test]
    fn test_proxy_uri_invalid() {
        let proxy = ProxyConfig::new("http://bad proxy");
        assert!(matches!(
            proxy_tunnel(&proxy, HttpConnector::new()),
            Err(RestError::InvalidUri { .. })
        ));
    }
}
