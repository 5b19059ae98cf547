//! # Orchestrator Service
//!
//! Ties the MCP client, health monitoring, the local fallback path and
//! error recovery together into one mode-driven execution layer.
//!
//! - `HealthMonitor`: periodic probes, health records and change events
//! - `BatchExecutor`: bounded-concurrency, order-preserving batches
//! - `FallbackHandler`: fixed registry of local read operations
//! - `Orchestrator`: the PRIMARY / FALLBACK / DEGRADED / RECOVERY state machine
//! - `OrchestratorStatus`: read-only snapshot for monitoring

pub mod batch;
pub use batch::{BatchExecutor, BatchOutcome, BatchStats};

pub mod config;
pub use config::{ConfigError, OrchestratorConfig};

pub mod fallback;
pub use fallback::{
    DataStore, FallbackHandler, FallbackOperation, FallbackQuery, FallbackStats, Row, SqliteDataStore,
};

pub mod health;
pub use health::{HealthConfig, HealthEvent, HealthMonitor, HealthState, ServerHealthRecord};

pub mod mode;
pub use mode::{ExecutionMode, ModeMetrics, ModeTransition};

pub mod orchestrator;
pub use orchestrator::{ExecutionResult, Orchestrator, FALLBACK_COMPONENT};

pub mod status;
pub use status::{ModeMetricsSummary, OrchestratorStatus};
