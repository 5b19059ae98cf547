//! # Error Recovery
//!
//! Classifies failures, recommends a recovery action per kind from an
//! operator-configurable table, owns the per-component circuit breakers and
//! keeps rolling statistics for observability.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot,
};
use crate::types::{ErrorKind, ToolError};

/// What the orchestrator should do about a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    Retry,
    RetryWithBackoff,
    Fallback,
    CircuitBreak,
    RefreshAuth,
    ClearCache,
    RestartConnection,
    /// Surface the failure without attempting recovery
    Fail,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecoveryAction::Retry => "RETRY",
            RecoveryAction::RetryWithBackoff => "RETRY_WITH_BACKOFF",
            RecoveryAction::Fallback => "FALLBACK",
            RecoveryAction::CircuitBreak => "CIRCUIT_BREAK",
            RecoveryAction::RefreshAuth => "REFRESH_AUTH",
            RecoveryAction::ClearCache => "CLEAR_CACHE",
            RecoveryAction::RestartConnection => "RESTART_CONNECTION",
            RecoveryAction::Fail => "FAIL",
        };
        f.write_str(name)
    }
}

/// Kind to action table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    actions: HashMap<ErrorKind, RecoveryAction>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        let actions = HashMap::from([
            (ErrorKind::Timeout, RecoveryAction::RetryWithBackoff),
            (ErrorKind::ConnectionRefused, RecoveryAction::RestartConnection),
            (ErrorKind::AuthenticationFailure, RecoveryAction::RefreshAuth),
            (ErrorKind::RateLimited, RecoveryAction::RetryWithBackoff),
            (ErrorKind::MalformedResponse, RecoveryAction::Fallback),
            (ErrorKind::ResourceExhausted, RecoveryAction::CircuitBreak),
            (ErrorKind::PoolExhausted, RecoveryAction::Fallback),
            (ErrorKind::UnsupportedOperation, RecoveryAction::Fail),
            (ErrorKind::InvalidArgument, RecoveryAction::Fail),
            (ErrorKind::Unknown, RecoveryAction::Fallback),
        ]);
        Self { actions }
    }
}

impl RecoveryPolicy {
    pub fn action_for(&self, kind: ErrorKind) -> RecoveryAction {
        self.actions
            .get(&kind)
            .copied()
            .unwrap_or(RecoveryAction::Fallback)
    }

    pub fn set(&mut self, kind: ErrorKind, action: RecoveryAction) -> &mut Self {
        self.actions.insert(kind, action);
        self
    }

    pub fn with(mut self, kind: ErrorKind, action: RecoveryAction) -> Self {
        self.set(kind, action);
        self
    }
}

static TIMEOUT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)timed? ?out|deadline").unwrap());
static CONNECTION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)connection|connect|refused|unreachable|reset by peer").unwrap());
static AUTH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)unauthori[sz]ed|forbidden|auth|\b401\b|\b403\b|api key").unwrap());
static RATE_LIMIT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)rate.?limit|too many requests|\b429\b").unwrap());
static EXHAUSTED_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)exhausted|overloaded|unavailable|capacity|\b503\b").unwrap());
static MALFORMED_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)json|parse|malformed|decode|unexpected response").unwrap());

fn matches(pattern: &Lazy<Regex>, message: &str) -> bool {
    pattern.is_match(message)
}

/// Classify untyped failure text, e.g. a JSON-RPC error message
pub fn classify_message(message: &str) -> ErrorKind {
    // "connection timed out" is a timeout, so timeouts are checked first.
    if matches(&TIMEOUT_PATTERN, message) {
        ErrorKind::Timeout
    } else if matches(&RATE_LIMIT_PATTERN, message) {
        ErrorKind::RateLimited
    } else if matches(&AUTH_PATTERN, message) {
        ErrorKind::AuthenticationFailure
    } else if matches(&EXHAUSTED_PATTERN, message) {
        ErrorKind::ResourceExhausted
    } else if matches(&CONNECTION_PATTERN, message) {
        ErrorKind::ConnectionRefused
    } else if matches(&MALFORMED_PATTERN, message) {
        ErrorKind::MalformedResponse
    } else {
        ErrorKind::Unknown
    }
}

/// One handled failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub component: String,
    pub message: String,
    pub action: RecoveryAction,
    pub timestamp: DateTime<Utc>,
    pub recovered: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentRecovery {
    pub recovered: u64,
    pub unrecovered: u64,
}

/// Settings for [`ErrorRecoveryManager`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub breaker: CircuitBreakerConfig,
    /// Maximum number of retained error records
    pub history_cap: usize,
    pub policy: RecoveryPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            history_cap: 1000,
            policy: RecoveryPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
struct RecoveryStats {
    history: VecDeque<ErrorRecord>,
    by_kind: HashMap<ErrorKind, u64>,
    by_component: HashMap<String, ComponentRecovery>,
    by_action: HashMap<RecoveryAction, u64>,
    total_errors: u64,
}

/// Statistics export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total_errors: u64,
    pub error_counts: HashMap<ErrorKind, u64>,
    pub component_recovery: HashMap<String, ComponentRecovery>,
    pub action_counts: HashMap<RecoveryAction, u64>,
    pub recent_errors: Vec<ErrorRecord>,
    pub circuit_breakers: Vec<CircuitSnapshot>,
}

pub struct ErrorRecoveryManager {
    policy: RwLock<RecoveryPolicy>,
    breakers: CircuitBreakerRegistry,
    stats: Mutex<RecoveryStats>,
    history_cap: usize,
}

impl ErrorRecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            policy: RwLock::new(config.policy),
            breakers: CircuitBreakerRegistry::new(config.breaker),
            stats: Mutex::new(RecoveryStats::default()),
            history_cap: config.history_cap.max(1),
        }
    }

    pub fn classify(&self, error: &ToolError) -> ErrorKind {
        error.kind()
    }

    /// The configured action for a kind
    pub fn recommend(&self, kind: ErrorKind) -> RecoveryAction {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .action_for(kind)
    }

    /// Override one entry of the action table at runtime
    pub fn set_action(&self, kind: ErrorKind, action: RecoveryAction) {
        info!(kind = %kind, action = %action, "Recovery action overridden");
        self.policy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(kind, action);
    }

    pub fn breaker(&self, component: &str) -> Arc<CircuitBreaker> {
        self.breakers.get(component)
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn reset_breaker(&self, component: &str) -> bool {
        self.breakers.reset(component)
    }

    /// Append an error record and update the rolling counters
    pub fn record(
        &self,
        component: &str,
        error: &ToolError,
        action: RecoveryAction,
        recovered: bool,
    ) -> ErrorRecord {
        let record = ErrorRecord {
            id: Uuid::new_v4(),
            kind: error.kind(),
            component: component.to_string(),
            message: error.to_string(),
            action,
            timestamp: Utc::now(),
            recovered,
        };

        counter!("recovery_errors_total", 1, "kind" => record.kind.as_str(), "component" => component.to_string());
        debug!(
            component,
            kind = %record.kind,
            action = %action,
            recovered,
            "Recorded failure"
        );

        let mut stats = self.lock_stats();
        stats.total_errors += 1;
        *stats.by_kind.entry(record.kind).or_insert(0) += 1;
        *stats.by_action.entry(action).or_insert(0) += 1;
        let entry = stats.by_component.entry(component.to_string()).or_default();
        if recovered {
            entry.recovered += 1;
        } else {
            entry.unrecovered += 1;
        }
        stats.history.push_back(record.clone());
        while stats.history.len() > self.history_cap {
            stats.history.pop_front();
        }
        record
    }

    /// Most recent records, newest last
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        let stats = self.lock_stats();
        let skip = stats.history.len().saturating_sub(limit);
        stats.history.iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        let circuit_breakers = self.breakers.snapshot();
        let stats = self.lock_stats();
        let skip = stats.history.len().saturating_sub(10);
        RecoveryStatistics {
            total_errors: stats.total_errors,
            error_counts: stats.by_kind.clone(),
            component_recovery: stats.by_component.clone(),
            action_counts: stats.by_action.clone(),
            recent_errors: stats.history.iter().skip(skip).cloned().collect(),
            circuit_breakers,
        }
    }

    /// Drop every record and counter; breakers are left untouched
    pub fn reset_statistics(&self) {
        *self.lock_stats() = RecoveryStats::default();
        info!("Recovery statistics reset");
    }

    fn lock_stats(&self) -> MutexGuard<'_, RecoveryStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ErrorRecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}
