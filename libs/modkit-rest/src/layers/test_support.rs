//! Scripted in-memory transport shared by the layer and client tests.

use crate::error::RestError;
use crate::response::{ResponseBody, full_body};
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

type Reply = Arc<dyn Fn(usize, &Recorded) -> Result<Response<ResponseBody>, RestError> + Send + Sync>;

/// One request as it reached the transport.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct RecordingService {
    seen: Arc<Mutex<Vec<Recorded>>>,
    reply: Reply,
}

pub fn response(status: u16, body: &'static str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .body(full_body(body))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::get(uri).body(Full::new(Bytes::new())).unwrap()
}

impl RecordingService {
    /// Answers every request with an empty 200.
    pub fn ok() -> Self {
        Self::with(|_, _| Ok(response(200, "")))
    }

    /// Answers the n-th request with the n-th status (the last one repeats).
    pub fn statuses(statuses: &[u16]) -> Self {
        let statuses = statuses.to_vec();
        Self::with(move |n, _| {
            let status = statuses[n.min(statuses.len() - 1)];
            Ok(response(status, "scripted"))
        })
    }

    pub fn with(
        reply: impl Fn(usize, &Recorded) -> Result<Response<ResponseBody>, RestError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            reply: Arc::new(reply),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn request(&self, n: usize) -> Recorded {
        self.seen.lock().unwrap()[n].clone()
    }

    pub fn header(&self, n: usize, name: &str) -> Option<String> {
        self.request(n)
            .headers
            .get(name)
            .map(|v| v.to_str().unwrap().to_owned())
    }
}

impl Service<Request<Full<Bytes>>> for RecordingService {
    type Response = Response<ResponseBody>;
    type Error = RestError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        let seen = self.seen.clone();
        let reply = self.reply.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await.unwrap().to_bytes();
            let recorded = Recorded {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body,
            };
            let n = {
                let mut seen = seen.lock().unwrap();
                seen.push(recorded.clone());
                seen.len() - 1
            };
            reply(n, &recorded)
        })
    }
}
