//! End-to-end run of the production assembly.
//!
//! A configuration file names a watched discovery document and a registry
//! snapshot path; the document points at a mock tool server speaking
//! JSON-RPC over HTTP. The test loads the configuration, discovers and
//! connects the server, routes a call through it and shuts down.

#![expect(
    clippy::expect_used,
    reason = "Test code uses expect for assertion clarity"
)]

use camino::{Utf8Path, Utf8PathBuf};
use mockito::{Matcher, Mock, Server, ServerGuard};
use rstest::{fixture, rstest};
use serde_json::{Value, json};
use switchboard::config::SwitchboardConfig;
use switchboard::fleet::{
    domain::ServerStatus,
    services::{IngestSummary, ServerQuery},
};
use tempfile::TempDir;

const SESSION: &str = "file-discovery-session";

#[fixture]
fn workspace() -> TempDir {
    TempDir::new().expect("temporary directory should be created")
}

fn utf8(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("temp path should be UTF-8")
}

fn rpc_reply(result: &Value) -> String {
    json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string()
}

/// Mocks a tool server offering `get_forecast`.
async fn mock_tool_server(server: &mut ServerGuard) -> Vec<Mock> {
    let mut mocks = Vec::new();
    mocks.push(
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("Mcp-Session-Id", SESSION)
            .with_body(rpc_reply(&json!({"protocolVersion": "2025-03-26"})))
            .create_async()
            .await,
    );
    mocks.push(
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(
                json!({"method": "notifications/initialized"}),
            ))
            .with_status(202)
            .create_async()
            .await,
    );
    mocks.push(
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "tools/list"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(rpc_reply(&json!({
                "tools": [{
                    "name": "get_forecast",
                    "description": "Forecast for a location",
                    "inputSchema": {"type": "object"},
                }],
            })))
            .create_async()
            .await,
    );
    mocks.push(
        server
            .mock("POST", "/mcp")
            .match_header("mcp-session-id", SESSION)
            .match_body(Matcher::PartialJson(json!({
                "method": "tools/call",
                "params": {"name": "get_forecast"},
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(rpc_reply(&json!({"content": [{"type": "text", "text": "Sunny"}]})))
            .create_async()
            .await,
    );
    mocks
}

fn write_config(root: &Utf8Path, tool_server_url: &str) -> Utf8PathBuf {
    let document = root.join("servers.json");
    std::fs::write(
        &document,
        json!([{
            "name": "weather",
            "url": format!("{tool_server_url}/mcp"),
            "priority": 10,
            "tags": ["forecast"],
        }])
        .to_string(),
    )
    .expect("discovery document should be written");

    let config = root.join("switchboard.json");
    std::fs::write(
        &config,
        json!({
            "registry_path": root.join("state").join("registry.json"),
            "registry_source": "file-discovery-test",
            "connect_timeout_ms": 2_000,
            "call_timeout_ms": 2_000,
            "discovery": [{
                "kind": "file_watch",
                "name": "local",
                "path": document,
                "interval_secs": 1,
            }],
        })
        .to_string(),
    )
    .expect("configuration should be written");
    config
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn watched_document_drives_discovery_connection_and_routing(workspace: TempDir) {
    let mut tool_server = Server::new_async().await;
    let _mocks = mock_tool_server(&mut tool_server).await;
    let delete = tool_server
        .mock("DELETE", "/mcp")
        .match_header("mcp-session-id", SESSION)
        .with_status(200)
        .create_async()
        .await;
    let root = utf8(&workspace);
    let config_path = write_config(&root, &tool_server.url());

    let config = SwitchboardConfig::load(&config_path).expect("configuration should load");
    let engine = config
        .build_switchboard()
        .await
        .expect("engine should assemble");
    let first = engine.discover_now().await;
    let second = engine.discover_now().await;
    let routed = engine
        .route("get_forecast", json!({"location": "London"}), None)
        .await
        .expect("route should succeed");
    let listed = engine.list(&ServerQuery::all()).await;
    engine.shutdown().await;

    assert_eq!(
        first.first().map(|report| report.outcome.clone()),
        Some(Ok(IngestSummary {
            document_changed: true,
            seen: 1,
            rejected: 0,
            created: 1,
            updated: 0,
            connect_attempts: 1,
            connected: 1,
        }))
    );
    assert!(matches!(
        second.first().map(|report| &report.outcome),
        Some(Ok(IngestSummary { document_changed: false, .. }))
    ));
    assert_eq!(routed.server.as_str(), "weather");
    assert_eq!(routed.result, json!({"content": [{"type": "text", "text": "Sunny"}]}));
    assert_eq!(
        listed.iter().map(|record| record.status()).collect::<Vec<_>>(),
        vec![ServerStatus::Connected]
    );
    delete.assert_async().await;

    let snapshot: Value = serde_json::from_slice(
        &std::fs::read(root.join("state").join("registry.json"))
            .expect("registry snapshot should exist"),
    )
    .expect("registry snapshot should be JSON");
    assert_eq!(
        snapshot.pointer("/metadata/source").and_then(Value::as_str),
        Some("file-discovery-test")
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn restart_reloads_registrations_from_the_snapshot(workspace: TempDir) {
    let mut tool_server = Server::new_async().await;
    let _mocks = mock_tool_server(&mut tool_server).await;
    let _delete = tool_server
        .mock("DELETE", "/mcp")
        .with_status(200)
        .create_async()
        .await;
    let root = utf8(&workspace);
    let config_path = write_config(&root, &tool_server.url());
    let config = SwitchboardConfig::load(&config_path).expect("configuration should load");

    let first = config.build_switchboard().await.expect("engine should assemble");
    first.discover_now().await;
    first.shutdown().await;
    drop(first);
    let second = config.build_switchboard().await.expect("engine should reassemble");
    let restored = second
        .get("weather")
        .await
        .expect("valid name")
        .expect("registration should survive the restart");

    assert_eq!(restored.status(), ServerStatus::Disconnected);
    assert_eq!(restored.priority(), 10);
    assert!(second.catalog().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn corrupt_snapshot_starts_an_empty_registry(workspace: TempDir) {
    let root = utf8(&workspace);
    let config_path = write_config(&root, "http://127.0.0.1:1");
    std::fs::create_dir_all(root.join("state")).expect("state directory should be created");
    std::fs::write(root.join("state").join("registry.json"), "{\"servers\": [")
        .expect("corrupt snapshot should be written");
    let config = SwitchboardConfig::load(&config_path).expect("configuration should load");

    let engine = config.build_switchboard().await.expect("engine should assemble");

    assert!(engine.list(&ServerQuery::all()).await.is_empty());
}
