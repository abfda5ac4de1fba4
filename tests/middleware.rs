mod common;

use common::{pool, proxy, status};
use reqwest_identity_pool::{ClientOptions, IdentityPoolMiddleware, RequestBody};
use reqwest_middleware::ClientBuilder;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

const API: &str = "https://api.example.test/v1/items";

#[tokio::test]
async fn requests_are_replayed_on_pooled_identities() {
    let (pool, state) = pool(common::config().proxies(vec![proxy(1)])).await;
    let client = ClientBuilder::new(reqwest::Client::new())
        .with(IdentityPoolMiddleware::from_pool(pool))
        .build();

    let response = assert_ok!(client.post(API).json(&json!({"name": "crate"})).send().await);
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let calls = state.calls_to(API);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].proxy.as_deref(), Some("10.0.0.1:1080"));
    assert_eq!(
        calls[0].request.body,
        RequestBody::Bytes(br#"{"name":"crate"}"#.to_vec())
    );
}

#[tokio::test]
async fn unrecovered_status_is_a_response() {
    let (pool, state) = pool(common::config()).await;
    state.reply(API, status(404));
    let client = ClientBuilder::new(reqwest::Client::new())
        .with(IdentityPoolMiddleware::from_pool(pool))
        .build();

    let response = assert_ok!(client.get(API).send().await);
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(response.url().as_str(), API);
}

#[tokio::test]
async fn acquisition_failure_is_a_middleware_error() {
    let (pool, state) = pool(common::config()).await;
    let middleware =
        IdentityPoolMiddleware::from_pool(pool).with_options(ClientOptions::default().only_proxy(true));
    let client = ClientBuilder::new(reqwest::Client::new()).with(middleware).build();

    let err = assert_err!(client.get(API).send().await);
    assert!(matches!(err, reqwest_middleware::Error::Middleware(_)));
    assert!(state.calls().is_empty());
}
