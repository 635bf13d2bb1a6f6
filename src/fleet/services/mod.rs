//! Services for registry management, connections, health monitoring,
//! discovery and tool routing.

mod connections;
mod discovery;
mod health;
mod registry;
mod router;
mod switchboard;

pub use connections::{Connection, ConnectionError, ConnectionManager, ConnectionResult};
pub use discovery::{DiscoveryEngine, IngestSummary, SourceReport};
pub use health::{HealthMonitor, HealthPolicy, ProbeFailure, ProbeOutcome};
pub use registry::{
    DEFAULT_EVENTS_CAPACITY, RegistrationOutcome, RegistryError, RegistryResult, ServerQuery,
    ServiceRegistry,
};
pub use router::{
    DispatchAttempt, RouteError, RouteErrorKind, RouteReport, RoutedCall, ToolRouter,
};
pub use switchboard::{
    EngineParts, EngineSettings, Switchboard, SwitchboardError, SwitchboardResult,
};
