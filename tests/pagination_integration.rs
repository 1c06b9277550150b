//! Integration tests for link-following pagination.
//!
//! These tests verify the full traversal flow against mock HTTP servers
//! that paginate with Link response headers.

use futures_util::StreamExt;
use refstore::{Client, LibraryKind, Params};
use serde_json::json;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> Client {
    Client::with_endpoint(server.uri(), "1", LibraryKind::User, None)
        .expect("client builds against mock endpoint")
}

fn link_header(server: &MockServer, relations: &[(&str, &str)]) -> String {
    relations
        .iter()
        .map(|(rel, fragment)| format!("<{}{}>; rel=\"{}\"", server.uri(), fragment, rel))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Mounts a three-page chain under /users/1/items.
async fn mount_three_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .and(query_param_is_missing("start"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "Link",
                    link_header(
                        server,
                        &[
                            ("self", "/users/1/items?limit=2"),
                            ("next", "/users/1/items?limit=2&start=2"),
                            ("last", "/users/1/items?limit=2&start=4"),
                        ],
                    )
                    .as_str(),
                )
                .set_body_json(json!([{"key": "A"}, {"key": "B"}])),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .and(query_param("start", "2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "Link",
                    link_header(
                        server,
                        &[
                            ("self", "/users/1/items?limit=2&start=2"),
                            ("next", "/users/1/items?limit=2&start=4"),
                        ],
                    )
                    .as_str(),
                )
                .set_body_json(json!([{"key": "C"}, {"key": "D"}])),
        )
        .mount(server)
        .await;

    // final page carries no next relation
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .and(query_param("start", "4"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "Link",
                    link_header(server, &[("self", "/users/1/items?limit=2&start=4")]).as_str(),
                )
                .set_body_json(json!([{"key": "E"}])),
        )
        .mount(server)
        .await;
}

fn keys(items: &[serde_json::Value]) -> Vec<&str> {
    items
        .iter()
        .filter_map(|item| item.get("key").and_then(serde_json::Value::as_str))
        .collect()
}

#[tokio::test]
async fn test_everything_concatenates_all_pages_in_order() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;
    let client = client_for(&server);

    let first = client.items(&Params::new().limit(2)).await.expect("first page");
    assert_eq!(first.len(), 2);

    let all = client.everything(first).await.expect("full traversal");
    assert_eq!(keys(&all), vec!["A", "B", "C", "D", "E"]);
}

#[tokio::test]
async fn test_follow_walks_one_page_at_a_time() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;
    let client = client_for(&server);

    let first = client.items(&Params::new().limit(2)).await.expect("first page");
    let mut pager = client.paginator(&first);
    assert!(!pager.is_exhausted());

    let second = pager.follow().await.expect("second page").expect("present");
    assert_eq!(keys(second.items()), vec!["C", "D"]);

    let third = pager.follow().await.expect("third page").expect("present");
    assert_eq!(keys(third.items()), vec!["E"]);

    assert!(pager.is_exhausted());
    let done = pager.follow().await.expect("terminal follow");
    assert!(done.is_none(), "exhausted cursor must yield nothing");
}

#[tokio::test]
async fn test_stream_is_lazy_and_finite() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;
    let client = client_for(&server);

    let first = client.items(&Params::new().limit(2)).await.expect("first page");
    let pages: Vec<_> = client
        .paginator(&first)
        .into_stream()
        .collect::<Vec<_>>()
        .await;

    assert_eq!(pages.len(), 2, "two pages remain after the first");
    let collected: Vec<String> = pages
        .into_iter()
        .map(|page| page.expect("page fetch"))
        .flat_map(refstore::Page::into_items)
        .filter_map(|item| {
            item.get("key")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        })
        .collect();
    assert_eq!(collected, vec!["C", "D", "E"]);
}

#[tokio::test]
async fn test_restart_from_self_allows_second_traversal() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;
    let client = client_for(&server);

    let first = client.items(&Params::new().limit(2)).await.expect("first page");
    let mut pager = client.paginator(&first);
    while pager.follow().await.expect("drain").is_some() {}
    assert!(pager.is_exhausted());

    // rewind to the first page of the original query and drain again
    pager.restart_from_self();
    assert!(!pager.is_exhausted());
    let mut replayed = Vec::new();
    while let Some(page) = pager.follow().await.expect("restarted follow") {
        replayed.extend(page.into_items());
    }
    assert_eq!(
        keys(&replayed),
        vec!["A", "B", "C", "D", "E"],
        "second traversal re-fetches the first page via its self link"
    );
}

#[tokio::test]
async fn test_single_resource_response_yields_no_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1/items/ABC123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"key": "ABC123"})))
        .mount(&server)
        .await;
    let client = client_for(&server);

    let item = client
        .item("ABC123", &Params::new())
        .await
        .expect("single item");
    assert_eq!(item["key"], "ABC123");
}

#[tokio::test]
async fn test_page_without_next_drains_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1/items"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Total-Results", "2")
                .set_body_json(json!([{"key": "A"}, {"key": "B"}])),
        )
        .mount(&server)
        .await;
    let client = client_for(&server);

    let first = client.items(&Params::new()).await.expect("only page");
    assert_eq!(first.total_results(), Some(2));

    let all = client.everything(first).await.expect("traversal");
    assert_eq!(keys(&all), vec!["A", "B"]);
    // exactly one request: the traversal added nothing
    let received = server.received_requests().await.expect("request log");
    assert_eq!(received.len(), 1);
}
