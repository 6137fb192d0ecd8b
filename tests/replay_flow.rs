//! Replay flow through a live daemon
//!
//! A stored exchange is replayed over the control plane; the rebuilt
//! request traverses the proxy, picks up its attribution from the replay
//! token, and is captured as a new row linked to the original.

mod common;

use common::{decode_body, gzip_bytes, TestDaemon};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_replay_links_rows_and_applies_headers() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/data"))
        .respond_with(ResponseTemplate::new(200).set_body_string("original"))
        .mount(&upstream)
        .await;

    let daemon = TestDaemon::start().await;

    // Capture the original exchange.
    daemon
        .client
        .get(format!("{}/v1/data", upstream.uri()))
        .send()
        .await
        .unwrap();
    let original = daemon.latest_request().await;
    let original_id = original["id"].as_str().unwrap().to_string();

    // The replayed request must carry the extra header.
    upstream.reset().await;
    Mock::given(method("GET"))
        .and(path("/v1/data"))
        .and(header("x-extra", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("replayed"))
        .mount(&upstream)
        .await;

    let result = daemon
        .rpc(
            "replayRequest",
            json!({
                "id": original_id,
                "initiator": "mcp",
                "overrides": {"setHeaders": {"x-extra": "1"}},
            }),
        )
        .await;
    assert_eq!(result["status"], 200);

    let replayed = daemon.latest_request().await;
    assert_ne!(replayed["id"].as_str().unwrap(), original_id);
    assert_eq!(replayed["replayedFromId"], original_id.as_str());
    assert_eq!(replayed["replayInitiator"], "mcp");
    assert_eq!(replayed["requestHeaders"]["x-extra"], "1");
    // The replay token is consumed by the proxy, never stored.
    assert!(replayed["requestHeaders"].get("procsi-replay-token").is_none());
    assert_eq!(decode_body(&replayed["responseBody"]), b"replayed");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_replay_of_gzip_upstream_stores_decoded() {
    let plaintext = br#"{"ok":true}"#;
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gz"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(gzip_bytes(plaintext), "application/json")
                .insert_header("content-encoding", "gzip"),
        )
        .mount(&upstream)
        .await;

    let daemon = TestDaemon::start().await;
    daemon
        .client
        .get(format!("{}/gz", upstream.uri()))
        .send()
        .await
        .unwrap();
    let original_id = daemon.latest_request().await["id"]
        .as_str()
        .unwrap()
        .to_string();

    let result = daemon
        .rpc("replayRequest", json!({"id": original_id}))
        .await;
    assert_eq!(result["status"], 200);

    let replayed = daemon.latest_request().await;
    assert_eq!(replayed["replayInitiator"], "tui");
    assert_eq!(decode_body(&replayed["responseBody"]), plaintext);
    assert!(replayed["responseHeaders"].get("content-encoding").is_none());

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_replay_unknown_request_errors() {
    let daemon = TestDaemon::start().await;
    let error = procsi::control::call(
        &daemon.layout.control_socket_path(),
        "replayRequest",
        Some(json!({"id": "ghost"})),
    )
    .await
    .unwrap_err();
    assert!(error.to_string().contains("Not found"));
    daemon.shutdown().await;
}
