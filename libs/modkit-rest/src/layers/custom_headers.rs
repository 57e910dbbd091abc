use http::{HeaderMap, Request};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Merges a fixed header set into every request.
///
/// Headers already present on the request (from the method declaration or
/// an argument) take precedence; all values of a configured name are added
/// only when the request has none.
#[derive(Clone, Debug, Default)]
pub struct CustomHeadersLayer {
    headers: Arc<HeaderMap>,
}

impl CustomHeadersLayer {
    #[must_use]
    pub fn new(headers: HeaderMap) -> Self {
        Self {
            headers: Arc::new(headers),
        }
    }
}

impl<S> Layer<S> for CustomHeadersLayer {
    type Service = CustomHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CustomHeadersService {
            inner,
            headers: Arc::clone(&self.headers),
        }
    }
}

#[derive(Clone)]
pub struct CustomHeadersService<S> {
    inner: S,
    headers: Arc<HeaderMap>,
}

impl<S, B> Service<Request<B>> for CustomHeadersService<S>
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
        let target = req.headers_mut();
        for name in self.headers.keys() {
            if target.contains_key(name) {
                continue;
            }
            for value in self.headers.get_all(name) {
                target.append(name.clone(), value.clone());
            }
        }
        self.inner.call(req)
    }
}
