#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end invocations against a mock HTTP server

use httpmock::prelude::*;
use modkit_rest::{
    Arg, ExceptionRegistry, MethodSpec, RestClient, RestClientBuilder, RestClientConfig, RestError,
    RestProxy, ReturnType, ServiceInterface,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize, PartialEq)]
struct Item {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
}

fn items() -> ServiceInterface {
    ServiceInterface::new("Items")
        .method(
            MethodSpec::new("getItem", http::Method::GET, "/items/{id}")
                .path_param("id")
                .returns(ReturnType::value::<Item>()),
        )
        .method(
            MethodSpec::new("deleteItem", http::Method::DELETE, "/items/{id}")
                .path_param("id")
                .expect(&[204]),
        )
        .method(
            MethodSpec::new("createItem", http::Method::POST, "/items")
                .body()
                .expect(&[201])
                .exception("ApiError")
                .exception_body::<ApiErrorBody>()
                .returns(ReturnType::value::<Item>()),
        )
        .method(
            MethodSpec::new("uploadBlob", http::Method::PUT, "/blobs/{name}")
                .path_param("name")
                .body(),
        )
        .method(
            MethodSpec::new("itemExists", http::Method::HEAD, "/items/{id}")
                .path_param("id")
                .expect(&[200, 404])
                .returns(ReturnType::HeadStatus),
        )
        .method(
            MethodSpec::new("searchItems", http::Method::GET, "/items")
                .query("q")
                .query("limit")
                .header("x-tenant")
                .returns(ReturnType::Bytes),
        )
}

fn client(server: &MockServer) -> RestClient {
    RestClientBuilder::with_config(RestClientConfig::for_testing(server.base_url()))
        .build()
        .unwrap()
}

fn proxy(server: &MockServer) -> RestProxy {
    let mut registry = ExceptionRegistry::with_defaults();
    registry.register_kind("ApiError");
    RestProxy::new(&items(), client(server))
        .unwrap()
        .with_exceptions(registry)
}

#[tokio::test]
async fn get_item_decodes_payload() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/items/7")
            .header_exists("x-request-id")
            .header_exists("x-attempt-id");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"name":"widget"}"#);
    });

    let item: Item = proxy(&server)
        .invoke("getItem", &["7".into()])
        .await
        .unwrap()
        .into_value()
        .unwrap();

    assert_eq!(
        item,
        Item {
            name: "widget".to_owned()
        }
    );
    mock.assert();
}

#[tokio::test]
async fn get_404_materializes_as_absent() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(GET).path("/items/404");
        then.status(404).body("not found");
    });

    let item: Option<Item> = proxy(&server)
        .invoke("getItem", &["404".into()])
        .await
        .unwrap()
        .into_option()
        .unwrap();
    assert!(item.is_none());
}

#[tokio::test]
async fn delete_404_raises_status_error() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(Method::DELETE).path("/items/404");
        then.status(404).body("no such item");
    });

    let err = proxy(&server)
        .invoke("deleteItem", &["404".into()])
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(http::StatusCode::NOT_FOUND));
    let service = err.service_error().unwrap();
    assert_eq!(service.kind(), "ServiceError");
    assert_eq!(service.message(), "Status code 404, no such item");
}

#[tokio::test]
async fn post_400_raises_declared_exception() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/items")
            .header("content-type", "application/json")
            .json_body(json!({"name": ""}));
        then.status(400)
            .header("content-type", "application/json")
            .body(r#"{"code":"bad"}"#);
    });

    let body = Arg::json(&json!({"name": ""})).unwrap();
    let err = proxy(&server).invoke("createItem", &[body]).await.unwrap_err();

    let service = match err {
        RestError::UnexpectedStatus(service) => service,
        other => panic!("expected UnexpectedStatus, got {other:?}"),
    };
    assert_eq!(service.kind(), "ApiError");
    assert_eq!(service.status(), http::StatusCode::BAD_REQUEST);
    assert_eq!(service.body::<ApiErrorBody>().unwrap().code, "bad");
    assert!(service.message().starts_with("Status code 400, "));
    mock.assert();
}

#[tokio::test]
async fn post_201_decodes_created_item() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(POST).path("/items");
        then.status(201).body(r#"{"name":"gadget"}"#);
    });

    let created: Item = proxy(&server)
        .invoke("createItem", &[Arg::json(&json!({"name": "gadget"})).unwrap()])
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(created.name, "gadget");
}

#[tokio::test]
async fn binary_body_is_sent_as_octet_stream() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(Method::PUT)
            .path("/blobs/logo.png")
            .header("content-type", "application/octet-stream")
            .body("\u{1}\u{2}\u{3}");
        then.status(204);
    });

    let output = proxy(&server)
        .invoke("uploadBlob", &["logo.png".into(), vec![1_u8, 2, 3].into()])
        .await
        .unwrap();

    assert!(output.is_none());
    mock.assert();
}

#[tokio::test]
async fn head_reports_existence() {
    let server = MockServer::start();
    let _found = server.mock(|when, then| {
        when.method(Method::HEAD).path("/items/7");
        then.status(200);
    });
    let _missing = server.mock(|when, then| {
        when.method(Method::HEAD).path("/items/8");
        then.status(404);
    });

    let proxy = proxy(&server);
    assert!(proxy.invoke("itemExists", &["7".into()]).await.unwrap().into_bool().unwrap());
    assert!(!proxy.invoke("itemExists", &["8".into()]).await.unwrap().into_bool().unwrap());
}

#[tokio::test]
async fn query_and_header_parameters() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/items")
            .query_param("q", "red widget")
            .header("x-tenant", "acme");
        then.status(200).body("raw");
    });

    let bytes = proxy(&server)
        .invoke("searchItems", &["red widget".into(), Arg::Null, "acme".into()])
        .await
        .unwrap()
        .into_bytes()
        .unwrap();

    assert_eq!(bytes, "raw");
    mock.assert();
}

#[test]
fn blocking_call_from_plain_thread() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(GET).path("/items/7");
        then.status(200).body(r#"{"name":"widget"}"#);
    });

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let proxy = {
        let _guard = runtime.enter();
        proxy(&server)
    };

    let item: Item = std::thread::spawn(move || {
        proxy
            .invoke_blocking("getItem", &["7".into()])
            .unwrap()
            .into_value()
            .unwrap()
    })
    .join()
    .unwrap();

    assert_eq!(item.name, "widget");
}
