//! Unit tests for the health monitor.

use std::sync::Arc;
use std::time::Duration;

use super::{Harness, ManualClock, endpoint, server_name};
use crate::fleet::{
    adapters::memory::{InMemoryRegistryStore, InMemoryTransport},
    domain::{ServerDescriptor, ServerName, ServerStatus},
    ports::{HealthCheckError, MockHealthCheck},
    services::{HealthMonitor, HealthPolicy, ProbeOutcome},
};
use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

type TestMonitor =
    HealthMonitor<InMemoryRegistryStore, InMemoryTransport, MockHealthCheck, ManualClock>;

#[fixture]
fn policy() -> HealthPolicy {
    HealthPolicy {
        probe_interval_ms: 50,
        probe_timeout_ms: 100,
        failure_threshold: 3,
        max_reconnect_attempts: 2,
        backoff_base_ms: 10,
        backoff_max_ms: 40,
        stale_after_secs: None,
    }
}

fn monitor(harness: &Harness, health_check: MockHealthCheck, policy: HealthPolicy) -> TestMonitor {
    HealthMonitor::new(
        Arc::clone(&harness.connections),
        Arc::new(health_check),
        policy,
    )
}

async fn status_of(harness: &Harness, name: &ServerName) -> Option<ServerStatus> {
    harness.registry.get(name).await.map(|record| record.status())
}

async fn failing_server(harness: &Harness) -> ServerName {
    let weather = harness.connected_server("weather", 10, &["forecast"]).await;
    harness
        .transport
        .set_probe_failure(&endpoint("weather"), true)
        .expect("toggle");
    weather
}

#[rstest]
#[case(1, 1_000)]
#[case(2, 2_000)]
#[case(3, 4_000)]
#[case(5, 16_000)]
#[case(6, 30_000)]
#[case(64, 30_000)]
fn backoff_doubles_up_to_the_ceiling(#[case] attempt: u32, #[case] expected_ms: u64) {
    let policy = HealthPolicy::default();
    assert_eq!(policy.backoff_delay(attempt), Duration::from_millis(expected_ms));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn three_failed_probes_escalate_to_failed(policy: HealthPolicy) {
    let harness = Harness::new().await;
    let weather = failing_server(&harness).await;
    let monitor = monitor(&harness, MockHealthCheck::new(), policy);

    let first = monitor.probe(&weather).await;
    let after_first = status_of(&harness, &weather).await;
    let second = monitor.probe(&weather).await;
    let third = monitor.probe(&weather).await;

    assert_eq!(first, ProbeOutcome::Unhealthy { failures: 1 });
    assert_eq!(after_first, Some(ServerStatus::Unhealthy));
    assert_eq!(second, ProbeOutcome::Unhealthy { failures: 2 });
    assert_eq!(third, ProbeOutcome::Failed);
    assert_eq!(status_of(&harness, &weather).await, Some(ServerStatus::Failed));
    assert!(harness.connections.connection(&weather).is_none());
    assert!(harness.connections.catalog().is_empty());
    assert_eq!(harness.transport.open_sessions().expect("sessions"), 0);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn one_success_recovers_an_unhealthy_server(policy: HealthPolicy) {
    let harness = Harness::new().await;
    let weather = failing_server(&harness).await;
    let monitor = monitor(&harness, MockHealthCheck::new(), policy);

    monitor.probe(&weather).await;
    monitor.probe(&weather).await;
    harness
        .transport
        .set_probe_failure(&endpoint("weather"), false)
        .expect("toggle");
    let recovered = monitor.probe(&weather).await;
    harness
        .transport
        .set_probe_failure(&endpoint("weather"), true)
        .expect("toggle");
    let next_failure = monitor.probe(&weather).await;

    assert_eq!(recovered, ProbeOutcome::Healthy);
    assert_eq!(next_failure, ProbeOutcome::Unhealthy { failures: 1 });
    assert!(harness.connections.connection(&weather).is_some());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn replaced_connection_starts_a_fresh_failure_count(policy: HealthPolicy) {
    let harness = Harness::new().await;
    let weather = failing_server(&harness).await;
    let monitor = monitor(&harness, MockHealthCheck::new(), policy);
    monitor.probe(&weather).await;
    monitor.probe(&weather).await;
    harness
        .transport
        .set_probe_failure(&endpoint("weather"), false)
        .expect("toggle");
    let replaced = harness
        .connections
        .reconnect(&weather)
        .await
        .expect("reconnect should succeed");
    harness
        .transport
        .set_probe_failure(&endpoint("weather"), true)
        .expect("toggle");

    let first_failure = monitor.probe(&weather).await;

    assert_eq!(first_failure, ProbeOutcome::Unhealthy { failures: 1 });
    assert_eq!(status_of(&harness, &weather).await, Some(ServerStatus::Unhealthy));
    assert_eq!(
        harness.connections.connection(&weather).map(|live| live.id()),
        Some(replaced.id())
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn hanging_probe_counts_as_failure(policy: HealthPolicy) {
    let harness = Harness::new().await;
    let weather = harness.connected_server("weather", 10, &["forecast"]).await;
    harness
        .transport
        .set_probe_hang(&endpoint("weather"), true)
        .expect("toggle");
    let monitor = monitor(&harness, MockHealthCheck::new(), policy);

    let outcome = tokio::time::timeout(Duration::from_secs(2), monitor.probe(&weather))
        .await
        .expect("probe should respect its timeout");

    assert_eq!(outcome, ProbeOutcome::Unhealthy { failures: 1 });
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn explicit_health_endpoint_replaces_the_protocol_probe(policy: HealthPolicy) {
    let harness = Harness::new().await;
    let weather = harness.add_server("weather", 10, &["forecast"]).await;
    harness
        .registry
        .register(
            ServerDescriptor::new("weather", endpoint("weather"))
                .expect("descriptor")
                .with_health_check_url("http://weather.test/health")
                .expect("valid health url"),
        )
        .await
        .expect("update should succeed");
    harness.connections.connect(&weather).await.expect("connect");
    let mut health_check = MockHealthCheck::new();
    health_check
        .expect_check()
        .withf(|url, _timeout| url.ends_with("weather.test/health"))
        .times(1)
        .returning(|_, _| Err(HealthCheckError::UnexpectedStatus(503)));
    let monitor = monitor(&harness, health_check, policy);

    let outcome = monitor.probe(&weather).await;

    assert_eq!(outcome, ProbeOutcome::Unhealthy { failures: 1 });
    let record = harness.registry.get(&weather).await.expect("record");
    assert!(record.last_checked().is_some());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn probing_a_disconnected_server_is_skipped(policy: HealthPolicy) {
    let harness = Harness::new().await;
    let weather = harness.add_server("weather", 10, &["forecast"]).await;
    let monitor = monitor(&harness, MockHealthCheck::new(), policy);

    assert_eq!(monitor.probe(&weather).await, ProbeOutcome::Skipped);
    assert_eq!(status_of(&harness, &weather).await, Some(ServerStatus::Registered));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn probe_all_covers_every_connected_server(policy: HealthPolicy) {
    let harness = Harness::new().await;
    harness.connected_server("weather", 10, &["forecast"]).await;
    harness.connected_server("maps", 10, &["route"]).await;
    harness.add_server("idle", 10, &["route"]).await;
    let monitor = monitor(&harness, MockHealthCheck::new(), policy);

    let outcomes = monitor.probe_all().await;

    assert_eq!(
        outcomes,
        vec![
            (server_name("maps"), ProbeOutcome::Healthy),
            (server_name("weather"), ProbeOutcome::Healthy),
        ]
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn stale_sweep_disconnects_but_keeps_the_registration(policy: HealthPolicy) {
    let harness = Harness::new().await;
    let weather = harness.connected_server("weather", 10, &["forecast"]).await;
    let maps = harness.connected_server("maps", 10, &["route"]).await;
    harness.clock.advance(chrono::Duration::minutes(10));
    harness
        .registry
        .record_contact(&maps)
        .await
        .expect("contact stamp should succeed");
    let monitor = monitor(
        &harness,
        MockHealthCheck::new(),
        HealthPolicy {
            stale_after_secs: Some(300),
            ..policy
        },
    );

    let swept = monitor.sweep_stale().await;

    assert_eq!(swept, vec![weather.clone()]);
    assert_eq!(status_of(&harness, &weather).await, Some(ServerStatus::Disconnected));
    assert!(harness.connections.connection(&weather).is_none());
    assert!(harness.connections.connection(&maps).is_some());
    assert!(harness.connections.catalog().providers("forecast").is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn stale_sweep_is_off_by_default(policy: HealthPolicy) {
    let harness = Harness::new().await;
    let weather = harness.connected_server("weather", 10, &["forecast"]).await;
    harness.clock.advance(chrono::Duration::days(1));
    let monitor = monitor(&harness, MockHealthCheck::new(), policy);

    assert!(monitor.sweep_stale().await.is_empty());
    assert!(harness.connections.connection(&weather).is_some());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn failed_server_reconnects_with_backoff(policy: HealthPolicy) {
    let harness = Harness::new().await;
    let weather = failing_server(&harness).await;
    let monitor = monitor(&harness, MockHealthCheck::new(), policy);
    for _ in 0..3 {
        monitor.probe(&weather).await;
    }
    harness
        .transport
        .set_probe_failure(&endpoint("weather"), false)
        .expect("toggle");

    let candidates = monitor.reconnect_candidates().await;
    let reconnected = monitor
        .reconnect_with_backoff(&weather, &CancellationToken::new())
        .await;

    assert_eq!(candidates, vec![weather.clone()]);
    assert!(reconnected);
    assert_eq!(status_of(&harness, &weather).await, Some(ServerStatus::Connected));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn exhausted_reconnects_leave_server_failed_and_unclaimed(policy: HealthPolicy) {
    let harness = Harness::new().await;
    let weather = failing_server(&harness).await;
    let monitor = monitor(&harness, MockHealthCheck::new(), policy);
    for _ in 0..3 {
        monitor.probe(&weather).await;
    }
    harness
        .transport
        .set_unreachable(&endpoint("weather"), true)
        .expect("toggle");

    let claimed = monitor.reconnect_candidates().await;
    let claimed_again = monitor.reconnect_candidates().await;
    let reconnected = monitor
        .reconnect_with_backoff(&weather, &CancellationToken::new())
        .await;
    let after_exhaustion = monitor.reconnect_candidates().await;

    assert_eq!(claimed, vec![weather.clone()]);
    assert!(claimed_again.is_empty());
    assert!(!reconnected);
    assert!(after_exhaustion.is_empty());
    assert_eq!(status_of(&harness, &weather).await, Some(ServerStatus::Failed));
    assert_eq!(
        harness.transport.open_count(&endpoint("weather")).expect("count"),
        1
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn background_loop_stops_on_cancel(policy: HealthPolicy) {
    let harness = Harness::new().await;
    let weather = failing_server(&harness).await;
    let monitor = Arc::new(monitor(&harness, MockHealthCheck::new(), policy));
    let token = CancellationToken::new();

    let task = tokio::spawn(Arc::clone(&monitor).run(token.clone()));
    tokio::time::sleep(Duration::from_millis(400)).await;
    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("monitor should stop")
        .expect("monitor task should not panic");

    assert_ne!(status_of(&harness, &weather).await, Some(ServerStatus::Connected));
}
