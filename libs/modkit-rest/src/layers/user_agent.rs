use crate::error::RestError;
use http::{HeaderValue, Request};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Outermost pipeline stage: stamps the client's `User-Agent`.
///
/// A value set by the caller (for instance through a header parameter)
/// is left untouched.
#[derive(Clone)]
pub struct UserAgentLayer {
    value: HeaderValue,
}

impl UserAgentLayer {
    /// # Errors
    /// Returns `RestError::InvalidHeaderValue` if `user_agent` is not a valid header value
    pub fn try_new(user_agent: impl AsRef<str>) -> Result<Self, RestError> {
        Ok(Self {
            value: HeaderValue::from_str(user_agent.as_ref())?,
        })
    }
}

impl<S> Layer<S> for UserAgentLayer {
    type Service = UserAgentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UserAgentService {
            inner,
            value: self.value.clone(),
        }
    }
}

#[derive(Clone)]
pub struct UserAgentService<S> {
    inner: S,
    value: HeaderValue,
}

impl<S, B> Service<Request<B>> for UserAgentService<S>
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
            .entry(http::header::USER_AGENT)
            .or_insert_with(|| self.value.clone());
        self.inner.call(req)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::layers::test_support::{RecordingService, get};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_user_agent_added_when_missing() {
        let recorder = RecordingService::ok();
        let svc = UserAgentLayer::try_new("inventory-client/2.1")
            .unwrap()
            .layer(recorder.clone());

        svc.oneshot(get("http://example.com/items")).await.unwrap();

        assert_eq!(
            recorder.header(0, "user-agent").as_deref(),
            Some("inventory-client/2.1")
        );
    }

    #[tokio::test]
    async fn test_caller_user_agent_wins() {
        let recorder = RecordingService::ok();
        let svc = UserAgentLayer::try_new("inventory-client/2.1")
            .unwrap()
            .layer(recorder.clone());

        let mut req = get("http://example.com/items");
        req.headers_mut()
            .insert(http::header::USER_AGENT, HeaderValue::from_static("custom/1.0"));
        svc.oneshot(req).await.unwrap();

        assert_eq!(recorder.header(0, "user-agent").as_deref(), Some("custom/1.0"));
    }

    #[test]
    fn test_invalid_user_agent_rejected() {
        assert!(matches!(
            UserAgentLayer::try_new("bad\x00agent"),
            Err(RestError::InvalidHeaderValue(_))
        ));
    }
}
