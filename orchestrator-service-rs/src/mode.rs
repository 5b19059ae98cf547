//! Execution modes and per-mode bookkeeping

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mcp_client::CacheKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Primary,
    Fallback,
    Degraded,
    Recovery,
}

impl ExecutionMode {
    pub const ALL: [ExecutionMode; 4] = [
        ExecutionMode::Primary,
        ExecutionMode::Fallback,
        ExecutionMode::Degraded,
        ExecutionMode::Recovery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Primary => "PRIMARY",
            ExecutionMode::Fallback => "FALLBACK",
            ExecutionMode::Degraded => "DEGRADED",
            ExecutionMode::Recovery => "RECOVERY",
        }
    }

    pub(crate) fn gauge_value(self) -> f64 {
        match self {
            ExecutionMode::Primary => 0.0,
            ExecutionMode::Recovery => 1.0,
            ExecutionMode::Fallback => 2.0,
            ExecutionMode::Degraded => 3.0,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the mode history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: ExecutionMode,
    pub to: ExecutionMode,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// The single current mode; only transitions mutate it
#[derive(Debug)]
pub(crate) struct ModeState {
    pub current: ExecutionMode,
    pub entered_at: DateTime<Utc>,
    pub entered: Instant,
    pub consecutive_errors: u32,
    pub history: VecDeque<ModeTransition>,
    pub history_cap: usize,
    pub transitions: u64,
}

impl ModeState {
    pub fn new(history_cap: usize) -> Self {
        Self {
            current: ExecutionMode::Primary,
            entered_at: Utc::now(),
            entered: Instant::now(),
            consecutive_errors: 0,
            history: VecDeque::new(),
            history_cap: history_cap.max(1),
            transitions: 0,
        }
    }

    /// Move to `to`, appending to the bounded history
    pub fn enter(&mut self, to: ExecutionMode, reason: &str) -> ModeTransition {
        let transition = ModeTransition {
            from: self.current,
            to,
            at: Utc::now(),
            reason: reason.to_string(),
        };
        self.current = to;
        self.entered_at = transition.at;
        self.entered = Instant::now();
        self.consecutive_errors = 0;
        self.transitions += 1;
        self.history.push_back(transition.clone());
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }
        transition
    }

    pub fn recent(&self, limit: usize) -> Vec<ModeTransition> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }
}

/// Attempts made while in one mode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeMetrics {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: f64,
}

impl ModeMetrics {
    pub fn record(&mut self, success: bool, latency: Duration) {
        self.executions += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_latency_ms += latency.as_secs_f64() * 1000.0;
    }

    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.total_latency_ms / self.executions as f64
        }
    }
}

/// Most recent successful payload per request, for degraded answers
#[derive(Debug)]
pub(crate) struct LastKnownGood {
    cap: usize,
    max_age: Duration,
    entries: HashMap<CacheKey, (Value, Instant)>,
    order: VecDeque<CacheKey>,
}

impl LastKnownGood {
    pub fn new(cap: usize, max_age: Duration) -> Self {
        Self {
            cap,
            max_age,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, key: CacheKey, value: Value) {
        if self.cap == 0 {
            return;
        }
        if self.entries.insert(key.clone(), (value, Instant::now())).is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key);
        while self.entries.len() > self.cap {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// The stored payload and its age, unless it is too old
    pub fn get(&mut self, key: &CacheKey) -> Option<(Value, Duration)> {
        let age = self.entries.get(key)?.1.elapsed();
        if age > self.max_age {
            self.entries.remove(key);
            self.order.retain(|k| k != key);
            return None;
        }
        self.entries.get(key).map(|(value, _)| (value.clone(), age))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn key(n: u64) -> CacheKey {
        let mut arguments = Map::new();
        arguments.insert("n".to_string(), json!(n));
        CacheKey::new("list_products", &arguments)
    }

    #[test]
    fn test_history_is_capped() {
        let mut state = ModeState::new(2);
        state.consecutive_errors = 4;
        state.enter(ExecutionMode::Fallback, "breaker open");
        assert_eq!(state.consecutive_errors, 0);
        state.enter(ExecutionMode::Recovery, "healthy");
        state.enter(ExecutionMode::Primary, "trial ok");

        assert_eq!(state.transitions, 3);
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].to, ExecutionMode::Recovery);
        assert_eq!(state.recent(1)[0].reason, "trial ok");
    }

    #[test]
    fn test_mode_metrics() {
        let mut metrics = ModeMetrics::default();
        assert_eq!(metrics.success_rate(), 0.0);
        metrics.record(true, Duration::from_millis(10));
        metrics.record(false, Duration::from_millis(30));
        assert_eq!(metrics.success_rate(), 0.5);
        assert!((metrics.average_latency_ms() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_last_known_good_evicts_oldest() {
        let mut store = LastKnownGood::new(2, Duration::from_secs(60));
        store.insert(key(1), json!(1));
        store.insert(key(2), json!(2));
        store.insert(key(1), json!(10));
        store.insert(key(3), json!(3));

        assert_eq!(store.len(), 2);
        assert!(store.get(&key(2)).is_none());
        assert_eq!(store.get(&key(1)).unwrap().0, json!(10));
    }

    #[test]
    fn test_last_known_good_expires() {
        let mut store = LastKnownGood::new(4, Duration::from_millis(5));
        store.insert(key(1), json!(1));
        std::thread::sleep(Duration::from_millis(15));
        assert!(store.get(&key(1)).is_none());
        assert_eq!(store.len(), 0);
    }
}
