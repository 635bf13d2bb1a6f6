//! Unit tests for the discovery engine.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{Harness, ManualClock, endpoint, server_name, tool};
use crate::fleet::{
    adapters::memory::{InMemoryRegistryStore, InMemoryTransport},
    domain::{DiscoveryDocument, ServerStatus},
    ports::{DiscoverySource, DiscoverySourceError},
    services::{DiscoveryEngine, IngestSummary},
};
use async_trait::async_trait;
use rstest::rstest;
use tokio_util::sync::CancellationToken;

type PollResult = Result<Option<DiscoveryDocument>, DiscoverySourceError>;

/// Source replaying scripted poll results, then reporting no change.
struct ScriptedSource {
    name: &'static str,
    interval: Duration,
    delay: Option<Duration>,
    script: Mutex<VecDeque<PollResult>>,
    polls: Mutex<usize>,
}

impl ScriptedSource {
    fn new(name: &'static str, script: impl IntoIterator<Item = PollResult>) -> Self {
        Self {
            name,
            interval: Duration::from_millis(100),
            delay: None,
            script: Mutex::new(script.into_iter().collect()),
            polls: Mutex::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn polls(&self) -> usize {
        *self.polls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DiscoverySource for ScriptedSource {
    fn name(&self) -> &str {
        self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll(&self) -> PollResult {
        *self.polls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Ok(None))
    }
}

fn document(raw: &str) -> DiscoveryDocument {
    DiscoveryDocument::from_slice(raw.as_bytes()).expect("document should parse")
}

type TestEngine = DiscoveryEngine<InMemoryRegistryStore, InMemoryTransport, ManualClock>;

fn engine(harness: &Harness, sources: Vec<Arc<dyn DiscoverySource>>) -> TestEngine {
    DiscoveryEngine::new(Arc::clone(&harness.connections), sources)
}

fn declare_endpoints(harness: &Harness, names: &[&str]) {
    for name in names {
        harness
            .transport
            .add_endpoint(endpoint(name), vec![tool(&format!("{name}_tool"))])
            .expect("endpoint setup");
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn ingest_registers_and_connects_auto_connect_records() {
    let harness = Harness::new().await;
    declare_endpoints(&harness, &["weather", "manual"]);
    let engine = engine(&harness, Vec::new());

    let summary = engine
        .ingest(
            "local",
            document(
                r#"[
                {"name":"weather","url":"http://weather.test/mcp","tags":["forecast"]},
                {"name":"manual","url":"http://manual.test/mcp","auto_connect":false},
                {"name":"","url":"http://blank.test/mcp"}
            ]"#,
            ),
        )
        .await;

    assert_eq!(
        summary,
        IngestSummary {
            document_changed: true,
            seen: 2,
            rejected: 1,
            created: 2,
            updated: 0,
            connect_attempts: 1,
            connected: 1,
        }
    );
    assert_eq!(harness.connections.connected_servers(), vec![server_name("weather")]);
    let manual = harness.registry.get(&server_name("manual")).await;
    assert_eq!(manual.map(|record| record.status()), Some(ServerStatus::Registered));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn discovery_never_removes_missing_records() {
    let harness = Harness::new().await;
    declare_endpoints(&harness, &["weather", "maps"]);
    let engine = engine(&harness, Vec::new());

    engine
        .ingest(
            "local",
            document(
                r#"[{"name":"weather","url":"http://weather.test/mcp"},
                    {"name":"maps","url":"http://maps.test/mcp"}]"#,
            ),
        )
        .await;
    let second = engine
        .ingest(
            "local",
            document(r#"[{"name":"weather","url":"http://weather.test/mcp"}]"#),
        )
        .await;

    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 0);
    assert!(harness.registry.get(&server_name("maps")).await.is_some());
    assert!(harness.connections.connection(&server_name("maps")).is_some());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn operator_disconnect_is_respected_by_discovery() {
    let harness = Harness::new().await;
    let weather = harness.connected_server("weather", 10, &["forecast"]).await;
    harness
        .connections
        .disconnect(&weather)
        .await
        .expect("disconnect should succeed");
    let engine = engine(&harness, Vec::new());

    let summary = engine
        .ingest(
            "local",
            document(r#"[{"name":"weather","url":"http://weather.test/mcp","priority":10}]"#),
        )
        .await;

    assert_eq!(summary.connect_attempts, 0);
    assert!(harness.connections.connection(&weather).is_none());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn failed_records_are_retried_by_discovery() {
    let harness = Harness::new().await;
    let weather = harness.add_server("weather", 10, &["forecast"]).await;
    harness
        .transport
        .set_unreachable(&endpoint("weather"), true)
        .expect("toggle");
    assert!(harness.connections.connect(&weather).await.is_err());
    harness
        .transport
        .set_unreachable(&endpoint("weather"), false)
        .expect("toggle");
    let engine = engine(&harness, Vec::new());

    let summary = engine
        .ingest(
            "local",
            document(r#"[{"name":"weather","url":"http://weather.test/mcp"}]"#),
        )
        .await;

    assert_eq!(summary.connected, 1);
    assert_eq!(
        harness.registry.get(&weather).await.map(|record| record.status()),
        Some(ServerStatus::Connected)
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn changed_url_is_merged_without_replacing_the_live_connection() {
    let harness = Harness::new().await;
    let weather = harness.connected_server("weather", 10, &["forecast"]).await;
    let engine = engine(&harness, Vec::new());

    let summary = engine
        .ingest(
            "central",
            document(r#"{"servers":[{"name":"weather","url":"http://weather-eu.test/mcp"}]}"#),
        )
        .await;

    let record = harness.registry.get(&weather).await.expect("record");
    let connection = harness.connections.connection(&weather).expect("connection");
    assert_eq!(summary.updated, 1);
    assert_eq!(record.url(), "http://weather-eu.test/mcp");
    assert_eq!(record.status(), ServerStatus::Connected);
    assert_eq!(connection.url(), endpoint("weather"));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn cycle_reports_each_source_independently() {
    let harness = Harness::new().await;
    declare_endpoints(&harness, &["weather"]);
    let broken: Arc<dyn DiscoverySource> = Arc::new(ScriptedSource::new(
        "broken",
        [Err(DiscoverySourceError::Parse {
            source_name: "broken".to_owned(),
            reason: "expected value".to_owned(),
        })],
    ));
    let healthy: Arc<dyn DiscoverySource> = Arc::new(ScriptedSource::new(
        "healthy",
        [Ok(Some(document(
            r#"[{"name":"weather","url":"http://weather.test/mcp"}]"#,
        )))],
    ));
    let engine = engine(&harness, vec![broken, healthy]);

    let reports = engine.run_cycle().await;
    let repeat = engine.run_cycle().await;

    assert_eq!(engine.source_names(), vec!["broken", "healthy"]);
    assert!(matches!(
        reports.first().map(|report| &report.outcome),
        Some(Err(DiscoverySourceError::Parse { .. }))
    ));
    assert!(matches!(
        reports.get(1).map(|report| &report.outcome),
        Some(Ok(IngestSummary { created: 1, connected: 1, .. }))
    ));
    assert!(repeat.iter().all(|report| matches!(
        report.outcome,
        Ok(IngestSummary { document_changed: false, .. })
    )));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn slow_poll_is_bounded_by_the_source_interval() {
    let harness = Harness::new().await;
    let slow: Arc<dyn DiscoverySource> =
        Arc::new(ScriptedSource::new("slow", []).with_delay(Duration::from_secs(5)));
    let engine = engine(&harness, vec![slow]);

    let reports = tokio::time::timeout(Duration::from_secs(2), engine.run_cycle())
        .await
        .expect("cycle should be bounded");

    assert!(matches!(
        reports.first().map(|report| &report.outcome),
        Some(Err(DiscoverySourceError::Timeout { .. }))
    ));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn background_sources_poll_until_cancelled() {
    let harness = Harness::new().await;
    let source = Arc::new(ScriptedSource::new("ticking", []));
    let engine = Arc::new(engine(&harness, vec![Arc::clone(&source) as Arc<dyn DiscoverySource>]));
    let token = CancellationToken::new();

    let task = tokio::spawn(Arc::clone(&engine).run(token.clone()));
    tokio::time::sleep(Duration::from_millis(350)).await;
    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("engine should stop")
        .expect("engine task should not panic");
    let polls_at_stop = source.polls();
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(polls_at_stop >= 3, "expected at least 3 polls, got {polls_at_stop}");
    assert_eq!(source.polls(), polls_at_stop);
}
