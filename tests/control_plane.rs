//! Control-plane behaviour against a live daemon
//!
//! Exercises the RPC surface the TUI and agents consume: filtered
//! listings, body search targets, bookmark protection, and event
//! polling.

mod common;

use common::TestDaemon;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn capture_pair(daemon: &TestDaemon, upstream: &MockServer) {
    // One exchange with the needle in the request body, one with it in
    // the response body.
    Mock::given(method("POST"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"{"found":"needle"}"#, "application/json"),
        )
        .mount(upstream)
        .await;

    daemon
        .client
        .post(format!("{}/a", upstream.uri()))
        .header("content-type", "application/json")
        .body(r#"{"note":"the needle is here"}"#)
        .send()
        .await
        .unwrap();
    daemon
        .client
        .get(format!("{}/b", upstream.uri()))
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_search_bodies_respects_target() {
    let upstream = MockServer::start().await;
    let daemon = TestDaemon::start().await;
    capture_pair(&daemon, &upstream).await;

    let in_request = daemon
        .rpc("searchBodies", json!({"query": "needle", "target": "request"}))
        .await;
    let in_request = in_request.as_array().unwrap();
    assert_eq!(in_request.len(), 1);
    assert_eq!(in_request[0]["path"], "/a");

    let in_response = daemon
        .rpc("searchBodies", json!({"query": "needle", "target": "response"}))
        .await;
    let in_response = in_response.as_array().unwrap();
    assert_eq!(in_response.len(), 1);
    assert_eq!(in_response[0]["path"], "/b");

    let both = daemon.rpc("searchBodies", json!({"query": "needle"})).await;
    assert_eq!(both.as_array().unwrap().len(), 2);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_json_body_query_extracts_values() {
    let upstream = MockServer::start().await;
    let daemon = TestDaemon::start().await;
    capture_pair(&daemon, &upstream).await;

    let rows = daemon
        .rpc("queryJsonBodies", json!({"path": "$.found"}))
        .await;
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["extractedValue"], "needle");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_filters_and_counts_over_rpc() {
    let upstream = MockServer::start().await;
    let daemon = TestDaemon::start().await;
    capture_pair(&daemon, &upstream).await;

    let total = daemon.rpc("countRequests", json!({})).await;
    assert_eq!(total, json!(2));

    let posts = daemon
        .rpc("countRequests", json!({"filter": {"methods": ["POST"]}}))
        .await;
    assert_eq!(posts, json!(1));

    let twoxx = daemon
        .rpc("countRequests", json!({"filter": {"statusRange": "2xx"}}))
        .await;
    assert_eq!(twoxx, json!(2));

    // Unrecognized statusRange forms are silently ignored.
    let bogus = daemon
        .rpc("countRequests", json!({"filter": {"statusRange": "999"}}))
        .await;
    assert_eq!(bogus, json!(2));

    let summaries = daemon
        .rpc("listRequestsSummary", json!({"filter": {"pathPrefix": "/a"}}))
        .await;
    let summaries = summaries.as_array().unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].get("requestBody").is_none());
    assert!(summaries[0]["requestBodySize"].as_u64().unwrap() > 0);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_bookmarks_survive_clear() {
    let upstream = MockServer::start().await;
    let daemon = TestDaemon::start().await;
    capture_pair(&daemon, &upstream).await;

    let summaries = daemon.rpc("listRequestsSummary", json!({})).await;
    let keep_id = summaries[0]["id"].as_str().unwrap().to_string();

    assert_eq!(daemon.rpc("saveRequest", json!({"id": keep_id})).await, json!(true));

    let cleared = daemon.rpc("clearRequests", json!({})).await;
    assert_eq!(cleared["deleted"], 1);

    let survivor = daemon.rpc("getRequest", json!({"id": keep_id})).await;
    assert_eq!(survivor["saved"], true);

    assert_eq!(
        daemon.rpc("unsaveRequest", json!({"id": keep_id})).await,
        json!(true)
    );

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_session_registration_and_attribution() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/attributed"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let daemon = TestDaemon::start().await;

    let session = daemon
        .rpc(
            "registerSession",
            json!({"label": "spawned", "pid": 4242, "source": "npm run dev"}),
        )
        .await;
    let session_id = session["id"].as_str().unwrap();
    let token = session["internalToken"].as_str().unwrap();

    daemon
        .client
        .get(format!("{}/attributed", upstream.uri()))
        .header("procsi-session-id", session_id)
        .header("procsi-session-token", token)
        .send()
        .await
        .unwrap();

    let row = daemon.latest_request().await;
    assert_eq!(row["sessionId"], session_id);
    assert_eq!(row["source"], "npm run dev");
    // Trusted headers never reach the stored request headers.
    assert!(row["requestHeaders"].get("procsi-session-id").is_none());
    assert!(row["requestHeaders"].get("procsi-session-token").is_none());

    // A wrong token falls back to the daemon session.
    daemon
        .client
        .get(format!("{}/attributed", upstream.uri()))
        .header("procsi-session-id", session_id)
        .header("procsi-session-token", "wrong")
        .send()
        .await
        .unwrap();
    let row = daemon.latest_request().await;
    assert_eq!(row["sessionId"], "daemon");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_interceptor_listing_and_event_polling() {
    let daemon = TestDaemon::start_with_scripts(&[
        (
            "good.rhai",
            r#"
                fn matches(request) { false }
                fn handler(ctx) { }
            "#,
        ),
        ("broken.rhai", "fn handler(ctx) {"),
    ])
    .await;

    let interceptors = daemon.rpc("listInterceptors", json!({})).await;
    let interceptors = interceptors.as_array().unwrap();
    assert_eq!(interceptors.len(), 2);
    let broken = interceptors
        .iter()
        .find(|i| i["file"] == "broken.rhai")
        .unwrap();
    assert!(broken["error"].as_str().unwrap().contains("compile error"));
    let good = interceptors.iter().find(|i| i["file"] == "good.rhai").unwrap();
    assert_eq!(good["hasMatcher"], true);

    let events = daemon
        .rpc("getInterceptorEvents", json!({"level": "error"}))
        .await;
    let error_events = events["events"].as_array().unwrap();
    assert_eq!(error_events.len(), 1);
    assert_eq!(error_events[0]["type"], "load_error");

    let reloaded = daemon.rpc("reloadInterceptors", json!({})).await;
    assert_eq!(reloaded["count"], 1);

    daemon.rpc("clearInterceptorEvents", json!({})).await;
    let events = daemon.rpc("getInterceptorEvents", json!({})).await;
    assert!(events["events"].as_array().unwrap().is_empty());

    daemon.shutdown().await;
}
