//! Read-only status snapshot for monitoring surfaces

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use error_handling_rs::{CircuitSnapshot, RecoveryStatistics};
use mcp_client::ClientStats;

use crate::batch::BatchStats;
use crate::fallback::FallbackStats;
use crate::health::ServerHealthRecord;
use crate::mode::{ExecutionMode, ModeMetrics, ModeTransition};

/// Number of transitions included in a snapshot
pub const RECENT_TRANSITIONS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ModeMetricsSummary {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
}

impl From<&ModeMetrics> for ModeMetricsSummary {
    fn from(metrics: &ModeMetrics) -> Self {
        Self {
            executions: metrics.executions,
            successes: metrics.successes,
            failures: metrics.failures,
            success_rate: metrics.success_rate(),
            average_latency_ms: metrics.average_latency_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub mode: ExecutionMode,
    pub entered_at: DateTime<Utc>,
    pub time_in_mode_secs: f64,
    pub consecutive_errors: u32,
    pub recovery_trial_in_flight: bool,
    pub recent_transitions: Vec<ModeTransition>,
    pub history_len: usize,
    pub total_transitions: u64,
    pub mode_metrics: BTreeMap<ExecutionMode, ModeMetricsSummary>,
    pub servers: Vec<ServerHealthRecord>,
    pub circuit_breakers: Vec<CircuitSnapshot>,
    pub recovery: RecoveryStatistics,
    pub client: ClientStats,
    pub fallback: FallbackStats,
    pub batch: BatchStats,
    pub last_known_good_entries: usize,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}
