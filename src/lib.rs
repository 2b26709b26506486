//! mcp-relay — aggregating MCP proxy.
//! Fronts a fleet of upstream MCP servers behind one downstream endpoint,
//! merging their tool, prompt, and resource listings under partial failure
//! and routing each invocation to the upstream that owns the named entity,
//! with per-upstream health tracking, error classification, and bounded
//! retries feeding a family of server-selection strategies.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod namespace;
pub mod registry;
pub mod retry;
pub mod routing;
pub mod select;
pub mod standalone;
pub mod upstream;

pub use config::{
    MonitoringConfig, OperationTimeouts, RelayConfig, SelectionStrategyConfig, StrategyKind,
    TransportConfig, UpstreamConfig,
};
pub use error::{classify_error, ErrorClass, ErrorClassifier, RelayError, Result};
pub use health::{HealthCheck, HealthMonitor, HealthSummary};
pub use metrics::{MetricsRecord, MetricsStore, QualityScore, UpstreamScore};
pub use registry::{RelayRegistry, UpstreamOverview};
pub use routing::{EntityKind, RoutingTables};
pub use select::{SelectionResult, SelectionStrategy};
pub use standalone::api::observability_router;
pub use standalone::server::RelayMcpServer;
pub use upstream::{ConnectionState, UpstreamHandle};
