//! Integration tests for the shared request layer.
//!
//! These tests verify status classification and the rate-limit replay
//! loop against mock HTTP servers, with the backoff unit compressed so
//! the 62-unit ceiling fits inside a test run.

use std::time::Duration;

use refstore::{Client, Error, LibraryKind, Params};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_client(server: &MockServer, api_key: Option<String>) -> Client {
    Client::with_endpoint(server.uri(), "1", LibraryKind::User, api_key)
        .expect("client builds against mock endpoint")
        .with_backoff_unit(Duration::from_millis(2))
}

#[tokio::test]
async fn test_rate_limit_replays_until_success() {
    let server = MockServer::start().await;
    // two 429s, then the real page
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"key": "A"}])))
        .mount(&server)
        .await;

    let client = fast_client(&server, None);
    let page = client.items(&Params::new()).await.expect("succeeds after backoff");
    assert_eq!(page.len(), 1);

    let received = server.received_requests().await.expect("request log");
    assert_eq!(received.len(), 3, "one initial attempt plus two replays");
}

#[tokio::test]
async fn test_rate_limit_gives_up_after_ceiling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let client = fast_client(&server, None);
    let error = client.items(&Params::new()).await.expect_err("must give up");
    match error {
        Error::TooManyRetries { waited_units } => assert_eq!(waited_units, 62),
        other => panic!("expected TooManyRetries, got: {other:?}"),
    }

    // the sixth consecutive 429 triggers give-up instead of a sixth wait
    let received = server.received_requests().await.expect("request log");
    assert_eq!(received.len(), 6, "one initial attempt plus five replays");
}

#[tokio::test]
async fn test_successful_response_resets_backoff_counter() {
    let server = MockServer::start().await;
    // first call: two 429s then success, which must reset the counter
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    // second call: rate-limited forever on a different path
    Mock::given(method("GET"))
        .and(path("/users/1/items/top"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let client = fast_client(&server, None);
    client.items(&Params::new()).await.expect("first call recovers");

    let error = client.top(&Params::new()).await.expect_err("second call gives up");
    assert!(matches!(error, Error::TooManyRetries { .. }));

    // a reset counter affords the full five replays again; without the
    // reset only four attempts would fit under the ceiling
    let top_requests = server
        .received_requests()
        .await
        .expect("request log")
        .iter()
        .filter(|r| r.url.path() == "/users/1/items/top")
        .count();
    assert_eq!(top_requests, 6);
}

#[tokio::test]
async fn test_not_found_classifies_with_context() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1/items/NOPE"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Item not found"))
        .mount(&server)
        .await;

    let client = fast_client(&server, None);
    let error = client
        .item("NOPE", &Params::new())
        .await
        .expect_err("404 must classify");
    match error {
        Error::ResourceNotFound { context } => {
            assert_eq!(context.status, 404);
            assert_eq!(context.method, "GET");
            assert!(context.url.contains("/users/1/items/NOPE"));
            assert_eq!(context.body, "Item not found");
        }
        other => panic!("expected ResourceNotFound, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_precondition_failed_classifies() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/users/1/items/ABC123"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let client = fast_client(&server, None);
    let stale = json!({"key": "ABC123", "version": 3, "data": {"title": "t"}});
    let error = client.update_item(&stale).await.expect_err("stale write");
    assert!(matches!(error, Error::PreConditionFailed { .. }));
}

#[tokio::test]
async fn test_unauthorised_classifies_for_401_and_403() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let client = fast_client(&server, None);
    let error = client.items(&Params::new()).await.expect_err("403");
    assert!(matches!(error, Error::UserNotAuthorised { .. }));
}

#[tokio::test]
async fn test_unmapped_status_becomes_generic_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = fast_client(&server, None);
    let error = client.items(&Params::new()).await.expect_err("500");
    match error {
        Error::Http { context } => {
            assert_eq!(context.status, 500);
            assert_eq!(context.body, "boom");
        }
        other => panic!("expected Http, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_api_requests_carry_bearer_and_version_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .and(header("Authorization", "Bearer secret-key"))
        .and(header("Refstore-API-Version", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = fast_client(&server, Some("secret-key".to_string()));
    client
        .items(&Params::new())
        .await
        .expect("headers matched, request succeeded");
}

#[tokio::test]
async fn test_version_header_rides_updates() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/users/1/items/ABC123"))
        .and(header("If-Unmodified-Since-Version", "42"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = fast_client(&server, None);
    let item = json!({"key": "ABC123", "version": 42, "data": {"title": "updated"}});
    client.update_item(&item).await.expect("update succeeds");
}

#[tokio::test]
async fn test_update_without_version_fails_before_network() {
    let server = MockServer::start().await;
    let client = fast_client(&server, None);

    let incomplete = json!({"key": "ABC123"});
    let error = client.update_item(&incomplete).await.expect_err("no version");
    assert!(matches!(error, Error::ParamNotPassed { .. }));

    let received = server.received_requests().await.expect("request log");
    assert!(received.is_empty(), "precondition must not reach the wire");
}

#[tokio::test]
async fn test_last_modified_version_read_from_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Last-Modified-Version", "1337")
                .set_body_json(json!([])),
        )
        .mount(&server)
        .await;

    let client = fast_client(&server, None);
    let version = client.last_modified_version().await.expect("version");
    assert_eq!(version, 1337);
}

#[tokio::test]
async fn test_retrieve_raw_passes_format_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .and(wiremock::matchers::query_param("format", "bibtex"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("@article{key, title={A Title}}"),
        )
        .mount(&server)
        .await;

    let client = fast_client(&server, None);
    let body = client
        .retrieve_raw("/items", &Params::new().format("bibtex"))
        .await
        .expect("raw retrieval");
    assert_eq!(&body[..], b"@article{key, title={A Title}}");
}

#[tokio::test]
async fn test_num_items_reads_total_results_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1/items/top"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Total-Results", "7050")
                .set_body_string("ABCD1234"),
        )
        .mount(&server)
        .await;

    let client = fast_client(&server, None);
    let total = client.num_items().await.expect("count");
    assert_eq!(total, 7050);
}
