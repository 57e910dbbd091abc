//! Dispatches interface method calls through the client.

use crate::args::Arg;
use crate::client::RestClient;
use crate::codec::{BodyCodec, JsonCodec};
use crate::descriptor::{CallMode, MethodDescriptor, MethodSpec};
use crate::error::RestError;
use crate::exception::ExceptionRegistry;
use crate::handle::{AsyncHandle, CallState, Progress};
use crate::layers::{REQUEST_ID_HEADER, fresh_id};
use crate::materialize::{Materializer, Output};
use crate::poll::poll_to_terminal;
use crate::request::RequestDescriptor;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::RuntimeFlavor;
use tracing::Instrument;

/// A named set of method declarations.
#[derive(Debug, Clone)]
pub struct ServiceInterface {
    name: String,
    methods: Vec<MethodSpec>,
}

impl ServiceInterface {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    #[must_use]
    pub fn method(mut self, spec: MethodSpec) -> Self {
        self.methods.push(spec);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Invokes the methods of a [`ServiceInterface`] over a [`RestClient`].
///
/// Descriptors are parsed once, when the proxy is created. The proxy is
/// cheap to clone and safe to share between tasks.
///
/// # Example
///
/// ```ignore
/// let items = ServiceInterface::new("Items").method(
///     MethodSpec::new("getItem", Method::GET, "/items/{id}")
///         .path_param("id")
///         .returns(ReturnType::value::<Item>()),
/// );
/// let proxy = RestProxy::new(&items, RestClient::builder("https://api.example.com").build()?)?;
///
/// let item: Option<Item> = proxy.invoke("getItem", &["42".into()]).await?.into_option()?;
/// ```
#[derive(Debug, Clone)]
pub struct RestProxy {
    interface: Arc<str>,
    client: RestClient,
    methods: Arc<HashMap<String, MethodDescriptor>>,
    codec: Arc<dyn BodyCodec>,
    exceptions: Arc<ExceptionRegistry>,
}

impl RestProxy {
    /// Parse every method of `interface`.
    ///
    /// # Errors
    ///
    /// Returns `RestError::MalformedInterface` for the first method whose
    /// declaration is invalid, or for a method name declared twice.
    pub fn new(interface: &ServiceInterface, client: RestClient) -> Result<Self, RestError> {
        let mut methods = HashMap::with_capacity(interface.methods.len());
        for spec in &interface.methods {
            let descriptor = MethodDescriptor::parse(spec)?;
            if methods.insert(spec.name().to_owned(), descriptor).is_some() {
                return Err(RestError::malformed(
                    spec.name(),
                    format!("declared twice on interface '{}'", interface.name),
                ));
            }
        }

        Ok(Self {
            interface: Arc::from(interface.name.as_str()),
            client,
            methods: Arc::new(methods),
            codec: Arc::new(JsonCodec),
            exceptions: Arc::new(ExceptionRegistry::with_defaults()),
        })
    }

    /// Use `codec` for structured bodies and payloads.
    #[must_use]
    pub fn with_codec(mut self, codec: impl BodyCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Use `exceptions` to construct errors for unexpected statuses.
    #[must_use]
    pub fn with_exceptions(mut self, exceptions: ExceptionRegistry) -> Self {
        self.exceptions = Arc::new(exceptions);
        self
    }

    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    #[must_use]
    pub fn client(&self) -> &RestClient {
        &self.client
    }

    #[must_use]
    pub fn descriptor(&self, method: &str) -> Option<&MethodDescriptor> {
        self.methods.get(method)
    }

    /// Build the request `method` would send for `args`, without sending it.
    ///
    /// # Errors
    ///
    /// Same as [`RequestDescriptor::build`], plus `MalformedInterface` for an
    /// undeclared method.
    pub fn build_request(&self, method: &str, args: &[Arg]) -> Result<RequestDescriptor, RestError> {
        let descriptor = self.lookup(method)?;
        RequestDescriptor::build(descriptor, args, self.client.base_url(), self.codec.as_ref())
    }

    /// Call any declared method and await its output.
    ///
    /// # Errors
    ///
    /// Returns the first error of the call: request building, transport,
    /// polling, unexpected status or payload decoding.
    pub async fn invoke(&self, method: &str, args: &[Arg]) -> Result<Output, RestError> {
        let descriptor = self.lookup(method)?;
        self.run(descriptor, args, &Progress::detached()).await
    }

    /// Call a blocking method from synchronous code.
    ///
    /// From outside any runtime the call is driven by the client's runtime.
    /// Inside a multi-threaded runtime the worker is handed off with
    /// `block_in_place`.
    ///
    /// # Errors
    ///
    /// Returns `RestError::MalformedInterface` if `method` is declared async,
    /// `RestError::Runtime` when called on a current-thread runtime, and
    /// otherwise the same errors as [`invoke`](Self::invoke).
    pub fn invoke_blocking(&self, method: &str, args: &[Arg]) -> Result<Output, RestError> {
        let descriptor = self.lookup(method)?;
        if descriptor.mode() != CallMode::Blocking {
            return Err(RestError::malformed(
                method,
                "declared with an async return type; use invoke_async",
            ));
        }

        let progress = Progress::detached();
        let call = self.run(descriptor, args, &progress);
        match tokio::runtime::Handle::try_current() {
            Err(_) => self.client.runtime().block_on(call),
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.client.runtime().block_on(call))
            }
            Ok(_) => Err(RestError::Runtime(
                "blocking invocation on a current-thread runtime would deadlock".to_owned(),
            )),
        }
    }

    /// Start an async method on the client's runtime.
    ///
    /// # Errors
    ///
    /// Returns `RestError::MalformedInterface` if `method` is undeclared or
    /// declared blocking. Call failures are reported through the handle.
    pub fn invoke_async(&self, method: &str, args: &[Arg]) -> Result<AsyncHandle<Output>, RestError> {
        let descriptor = self.lookup(method)?;
        if descriptor.mode() != CallMode::Async {
            return Err(RestError::malformed(
                method,
                "declared with a blocking return type; use invoke_blocking",
            ));
        }

        let proxy = self.clone();
        let method = method.to_owned();
        let args = args.to_vec();
        Ok(AsyncHandle::spawn(self.client.runtime(), move |progress| async move {
            let descriptor = proxy.lookup(&method)?;
            proxy.run(descriptor, &args, &progress).await
        }))
    }

    fn lookup(&self, method: &str) -> Result<&MethodDescriptor, RestError> {
        self.methods.get(method).ok_or_else(|| {
            RestError::malformed(
                method,
                format!("not declared on interface '{}'", self.interface),
            )
        })
    }

    async fn run(
        &self,
        descriptor: &MethodDescriptor,
        args: &[Arg],
        progress: &Progress,
    ) -> Result<Output, RestError> {
        let mut request =
            RequestDescriptor::build(descriptor, args, self.client.base_url(), self.codec.as_ref())?;
        let request_id = request
            .headers
            .entry(REQUEST_ID_HEADER)
            .or_insert_with(fresh_id)
            .to_str()
            .unwrap_or_default()
            .to_owned();

        let span = tracing::debug_span!(
            "rest_call",
            interface = %self.interface,
            method = descriptor.name(),
            request_id = %request_id
        );

        async move {
            progress.set(CallState::Sent);
            let response = match descriptor.poller() {
                Some(poller) => {
                    let origin = request.clone();
                    let first = self.client.send(request).await?;
                    poll_to_terminal(&self.client, poller.as_ref(), &origin, first, progress).await?
                }
                None => self.client.send(request).await?,
            };

            Materializer::new(self.codec.clone(), self.exceptions.clone())
                .materialize(response, descriptor)
                .await
        }
        .instrument(span)
        .await
        .inspect_err(|e| tracing::debug!(error = %e, "call failed"))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::builder::RestClientBuilder;
    use crate::config::RestClientConfig;
    use crate::descriptor::ReturnType;
    use crate::layers::test_support::{RecordingService, response};
    use http::Method;
    use serde::Deserialize;
    use tower::ServiceExt;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        name: String,
    }

    fn items() -> ServiceInterface {
        ServiceInterface::new("Items")
            .method(
                MethodSpec::new("getItem", Method::GET, "/items/{id}")
                    .path_param("id")
                    .returns(ReturnType::value::<Item>()),
            )
            .method(
                MethodSpec::new("getItemAsync", Method::GET, "/items/{id}")
                    .path_param("id")
                    .returns(ReturnType::async_of(ReturnType::value::<Item>())),
            )
    }

    fn proxy(recorder: &RecordingService) -> RestProxy {
        let client = RestClientBuilder::with_config(RestClientConfig::for_testing("http://svc.local"))
            .with_transport(recorder.clone().boxed_clone())
            .build()
            .unwrap();
        RestProxy::new(&items(), client).unwrap()
    }

    fn widget() -> RecordingService {
        RecordingService::with(|_, _| Ok(response(200, r#"{"name":"widget"}"#)))
    }

    #[tokio::test]
    async fn test_invoke_get_item() {
        let recorder = widget();
        let item: Item = proxy(&recorder)
            .invoke("getItem", &["7".into()])
            .await
            .unwrap()
            .into_value()
            .unwrap();

        assert_eq!(item.name, "widget");
        assert_eq!(recorder.calls(), 1);
        assert_eq!(recorder.request(0).uri, "http://svc.local/items/7");
        assert!(recorder.header(0, "x-request-id").is_some());
    }

    #[tokio::test]
    async fn test_undeclared_method() {
        let err = proxy(&widget()).invoke("deleteItem", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            RestError::MalformedInterface { method, reason }
                if method == "deleteItem" && reason.contains("'Items'")
        ));
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let client = RestClientBuilder::with_config(RestClientConfig::for_testing("http://svc.local"))
            .build()
            .unwrap();
        let interface = ServiceInterface::new("Dup")
            .method(MethodSpec::new("ping", Method::GET, "/ping"))
            .method(MethodSpec::new("ping", Method::HEAD, "/ping"));

        assert!(matches!(
            RestProxy::new(&interface, client),
            Err(RestError::MalformedInterface { reason, .. }) if reason.contains("declared twice")
        ));
    }

    #[tokio::test]
    async fn test_wrong_entry_point() {
        let proxy = proxy(&widget());
        assert!(matches!(
            proxy.invoke_async("getItem", &["7".into()]),
            Err(RestError::MalformedInterface { .. })
        ));
        assert!(matches!(
            proxy.invoke_blocking("getItemAsync", &["7".into()]),
            Err(RestError::MalformedInterface { .. })
        ));
    }

    #[tokio::test]
    async fn test_invoke_async_resolves() {
        let recorder = widget();
        let handle = proxy(&recorder).invoke_async("getItemAsync", &["7".into()]).unwrap();
        let item: Item = handle.await.unwrap().into_value().unwrap();
        assert_eq!(item.name, "widget");
    }

    #[tokio::test]
    async fn test_blocking_on_current_thread_runtime_is_rejected() {
        let err = proxy(&widget()).invoke_blocking("getItem", &["7".into()]).unwrap_err();
        assert!(matches!(err, RestError::Runtime(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_inside_multi_thread_runtime() {
        let recorder = widget();
        let proxy = proxy(&recorder);
        let output = proxy.invoke_blocking("getItem", &["7".into()]).unwrap();
        assert_eq!(output.into_value::<Item>().unwrap().name, "widget");
    }

    #[tokio::test]
    async fn test_build_request_does_not_send() {
        let recorder = widget();
        let request = proxy(&recorder).build_request("getItem", &["a b".into()]).unwrap();
        assert_eq!(request.url, "http://svc.local/items/a%20b");
        assert_eq!(recorder.calls(), 0);
    }
}
