//! Unit tests for the fleet domain and services.

mod discovery_tests;
mod health_tests;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::fleet::{
    adapters::memory::{InMemoryRegistryStore, InMemoryTransport},
    domain::{ServerDescriptor, ServerName, ToolDescriptor},
    services::{ConnectionManager, DEFAULT_EVENTS_CAPACITY, ServiceRegistry},
};
use chrono::{DateTime, Local, TimeZone, Utc};
use mockable::Clock;
use serde_json::json;

/// Clock that only moves when a test advances it.
#[derive(Debug)]
pub(super) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(super) fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2026, 1, 1, 9, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            now: Mutex::new(start),
        }
    }

    pub(super) fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(super) type TestRegistry = ServiceRegistry<InMemoryRegistryStore, ManualClock>;
pub(super) type TestConnections =
    ConnectionManager<InMemoryRegistryStore, InMemoryTransport, ManualClock>;

/// Registry and connection manager over shared in-memory adapters.
pub(super) struct Harness {
    pub(super) store: InMemoryRegistryStore,
    pub(super) transport: InMemoryTransport,
    pub(super) clock: Arc<ManualClock>,
    pub(super) registry: Arc<TestRegistry>,
    pub(super) connections: Arc<TestConnections>,
}

impl Harness {
    pub(super) async fn new() -> Self {
        Self::with_store(InMemoryRegistryStore::new()).await
    }

    pub(super) async fn with_store(store: InMemoryRegistryStore) -> Self {
        let transport = InMemoryTransport::new();
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(
            ServiceRegistry::open(
                Arc::new(store.clone()),
                Arc::clone(&clock),
                "unit-tests",
                DEFAULT_EVENTS_CAPACITY,
            )
            .await,
        );
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            Arc::new(transport.clone()),
            Arc::clone(&clock),
            Duration::from_millis(200),
        ));

        Self {
            store,
            transport,
            clock,
            registry,
            connections,
        }
    }

    /// Declares an endpoint at `http://{name}.test/mcp` offering `tools`
    /// and registers it with `priority`.
    pub(super) async fn add_server(&self, name: &str, priority: i32, tools: &[&str]) -> ServerName {
        let url = endpoint(name);
        self.transport
            .add_endpoint(url.clone(), tools.iter().map(|tool_name| tool(tool_name)).collect())
            .expect("endpoint setup should succeed");
        let descriptor = ServerDescriptor::new(name, url)
            .expect("valid descriptor")
            .with_priority(priority);
        let (registration, _) = self
            .registry
            .register(descriptor)
            .await
            .expect("registration should succeed");
        registration.name().clone()
    }

    pub(super) async fn connected_server(
        &self,
        name: &str,
        priority: i32,
        tools: &[&str],
    ) -> ServerName {
        let server = self.add_server(name, priority, tools).await;
        self.connections
            .connect(&server)
            .await
            .expect("connect should succeed");
        server
    }
}

pub(super) fn endpoint(name: &str) -> String {
    format!("http://{name}.test/mcp")
}

pub(super) fn tool(name: &str) -> ToolDescriptor {
    ToolDescriptor::new(name, format!("{name} tool"), json!({"type": "object"}))
        .expect("valid tool descriptor")
}

pub(super) fn server_name(raw: &str) -> ServerName {
    ServerName::new(raw).expect("valid server name")
}
