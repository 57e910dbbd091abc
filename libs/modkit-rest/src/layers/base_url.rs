use crate::error::{InvalidUriKind, RestError};
use futures::future::Either;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Request, Uri};
use std::future::{Ready, ready};
use std::task::{Context, Poll};
use tower::{Layer, Service};

#[derive(Clone, Debug)]
struct Target {
    scheme: Scheme,
    authority: Authority,
    /// Path prefix without a trailing slash (may be empty)
    prefix: String,
}

/// Redirects every request to an override endpoint.
///
/// Scheme and authority are replaced and the override's path is prepended
/// to the request path, so `https://api.example.com/v1/items?x=1` sent
/// through an override of `http://localhost:8080/mock` leaves as
/// `http://localhost:8080/mock/v1/items?x=1`. Without an override the
/// stage passes requests through untouched.
#[derive(Clone, Debug, Default)]
pub struct BaseUrlLayer {
    target: Option<Target>,
}

impl BaseUrlLayer {
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `RestError::InvalidUri` if `url` is not absolute
    pub fn try_new(url: &str) -> Result<Self, RestError> {
        let invalid = |kind, reason: &str| RestError::InvalidUri {
            url: url.to_owned(),
            kind,
            reason: reason.to_owned(),
        };

        let uri: Uri = url
            .parse()
            .map_err(|e: http::uri::InvalidUri| invalid(InvalidUriKind::ParseError, &e.to_string()))?;
        let parts = uri.into_parts();
        let scheme = parts
            .scheme
            .ok_or_else(|| invalid(InvalidUriKind::MissingScheme, "missing scheme"))?;
        let authority = parts
            .authority
            .ok_or_else(|| invalid(InvalidUriKind::MissingAuthority, "missing host/authority"))?;
        let prefix = parts
            .path_and_query
            .map(|pq| pq.path().trim_end_matches('/').to_owned())
            .unwrap_or_default();

        Ok(Self {
            target: Some(Target {
                scheme,
                authority,
                prefix,
            }),
        })
    }
}

impl Target {
    fn rewrite(&self, original: &Uri) -> Result<Uri, RestError> {
        let tail = original.path_and_query().map_or("/", PathAndQuery::as_str);
        let path_and_query = format!("{}{tail}", self.prefix);

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(RestError::RequestBuild)
    }
}

impl<S> Layer<S> for BaseUrlLayer {
    type Service = BaseUrlService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BaseUrlService {
            inner,
            target: self.target.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BaseUrlService<S> {
    inner: S,
    target: Option<Target>,
}

impl<S, B> Service<Request<B>> for BaseUrlService<S>
where
    S: Service<Request<B>>,
    S::Error: From<RestError>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Either<Ready<Result<S::Response, S::Error>>, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        if let Some(target) = &self.target {
            match target.rewrite(req.uri()) {
                Ok(uri) => {
                    tracing::trace!(from = %req.uri(), to = %uri, "base URL override applied");
                    *req.uri_mut() = uri;
                }
                Err(e) => return Either::Left(ready(Err(e.into()))),
            }
        }
        Either::Right(self.inner.call(req))
    }
}
