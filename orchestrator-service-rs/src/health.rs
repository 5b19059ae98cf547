//! Connection health monitoring
//!
//! [`HealthMonitor`] probes every registered tool server on a fixed interval
//! and keeps one [`ServerHealthRecord`] per server. State changes are
//! published as [`HealthEvent`]s on a broadcast channel; the monitor is the
//! only writer of the records.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use error_handling_rs::ToolError;
use mcp_client::{EnhancedClient, ServedBy, ToolCallRequest, ToolCallResult};

use crate::batch::BatchExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "HEALTHY",
            HealthState::Degraded => "DEGRADED",
            HealthState::Unhealthy => "UNHEALTHY",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            HealthState::Healthy => 0.0,
            HealthState::Degraded => 1.0,
            HealthState::Unhealthy => 2.0,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub check_interval: Duration,
    /// Consecutive probe failures before a server is UNHEALTHY
    pub failure_threshold: u32,
    /// Number of recent probes the success rate is computed over
    pub success_window: usize,
    pub probe_timeout: Duration,
    /// Calls in flight at once in `batch_execute`
    pub batch_concurrency: usize,
    pub event_capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            failure_threshold: 3,
            success_window: 20,
            probe_timeout: Duration::from_secs(10),
            batch_concurrency: 5,
            event_capacity: 64,
        }
    }
}

/// Health of one tool server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHealthRecord {
    pub server_id: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Share of successful probes over the recent window
    pub success_rate: f64,
    pub total_checks: u64,
    pub last_error: Option<String>,
    pub response_time_ms: Option<f64>,
    #[serde(skip)]
    window: VecDeque<bool>,
}

impl ServerHealthRecord {
    /// Servers start HEALTHY until a probe says otherwise
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_check_at: None,
            last_success_at: None,
            success_rate: 1.0,
            total_checks: 0,
            last_error: None,
            response_time_ms: None,
            window: VecDeque::new(),
        }
    }

    /// Fold one probe outcome into the record, returning the previous state
    /// when it changed
    fn apply(
        &mut self,
        outcome: Result<(), &ToolError>,
        elapsed: Duration,
        config: &HealthConfig,
    ) -> Option<HealthState> {
        let now = Utc::now();
        let previous = self.state;
        self.last_check_at = Some(now);
        self.total_checks += 1;
        self.response_time_ms = Some(elapsed.as_secs_f64() * 1000.0);

        match outcome {
            Ok(()) => {
                self.state = HealthState::Healthy;
                self.consecutive_failures = 0;
                self.last_success_at = Some(now);
                self.last_error = None;
            }
            Err(err) => {
                self.consecutive_failures += 1;
                self.last_error = Some(err.to_string());
                self.state = if self.consecutive_failures >= config.failure_threshold {
                    HealthState::Unhealthy
                } else {
                    HealthState::Degraded
                };
            }
        }

        self.window.push_back(outcome.is_ok());
        while self.window.len() > config.success_window.max(1) {
            self.window.pop_front();
        }
        let successes = self.window.iter().filter(|ok| **ok).count();
        self.success_rate = successes as f64 / self.window.len() as f64;

        (previous != self.state).then_some(previous)
    }
}

/// A change of a server's health state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub server_id: String,
    pub old_state: HealthState,
    pub new_state: HealthState,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

pub struct HealthMonitor {
    client: Arc<EnhancedClient>,
    config: HealthConfig,
    records: RwLock<HashMap<String, ServerHealthRecord>>,
    events: broadcast::Sender<HealthEvent>,
    batch: BatchExecutor,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(client: Arc<EnhancedClient>, config: HealthConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            client,
            batch: BatchExecutor::new(config.batch_concurrency),
            config,
            records: RwLock::new(HashMap::new()),
            events,
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<EnhancedClient> {
        &self.client
    }

    pub fn batch(&self) -> &BatchExecutor {
        &self.batch
    }

    /// Start tracking a server; a known server keeps its record
    pub async fn register(&self, server_id: &str) {
        let mut records = self.records.write().await;
        if !records.contains_key(server_id) {
            debug!(server_id, "Tracking server health");
            records.insert(server_id.to_string(), ServerHealthRecord::new(server_id));
            gauge!("mcp_server_health", HealthState::Healthy.gauge_value(), "server_id" => server_id.to_string());
        }
    }

    /// Track every server the client knows about
    pub async fn register_all(&self) {
        for server_id in self.client.server_ids() {
            self.register(&server_id).await;
        }
    }

    /// Receive every future state change
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Probe one server now and update its record
    pub async fn check_server(&self, server_id: &str) -> HealthState {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.probe_timeout, self.client.probe(server_id)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ToolError::timeout(format!(
                "health probe of {} exceeded {}ms",
                server_id,
                self.config.probe_timeout.as_millis()
            ))),
        };
        let elapsed = started.elapsed();
        histogram!("mcp_health_probe_ms", elapsed.as_secs_f64() * 1000.0, "server_id" => server_id.to_string());

        let (state, event) = {
            let mut records = self.records.write().await;
            let record = records
                .entry(server_id.to_string())
                .or_insert_with(|| ServerHealthRecord::new(server_id));
            let changed = record.apply(outcome.as_ref().map(|_| ()), elapsed, &self.config);
            let event = changed.map(|old_state| HealthEvent {
                server_id: server_id.to_string(),
                old_state,
                new_state: record.state,
                timestamp: record.last_check_at.unwrap_or_else(Utc::now),
                error: record.last_error.clone(),
            });
            (record.state, event)
        };

        if let Err(err) = &outcome {
            debug!(server_id, error = %err, "Health probe failed");
        }

        if let Some(event) = event {
            if event.new_state == HealthState::Healthy {
                info!(server_id, old = %event.old_state, new = %event.new_state, "Server health changed");
            } else {
                warn!(server_id, old = %event.old_state, new = %event.new_state, "Server health changed");
            }
            gauge!("mcp_server_health", event.new_state.gauge_value(), "server_id" => server_id.to_string());
            counter!(
                "mcp_health_transitions",
                1,
                "server_id" => server_id.to_string(),
                "to" => event.new_state.as_str()
            );
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        state
    }

    /// Probe every tracked server concurrently
    pub async fn check_all(&self) -> Vec<(String, HealthState)> {
        let mut ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        let states = join_all(ids.iter().map(|id| self.check_server(id))).await;
        ids.into_iter().zip(states).collect()
    }

    pub async fn record(&self, server_id: &str) -> Option<ServerHealthRecord> {
        self.records.read().await.get(server_id).cloned()
    }

    /// All records ordered by server id
    pub async fn records(&self) -> Vec<ServerHealthRecord> {
        let mut records: Vec<ServerHealthRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        records
    }

    pub async fn state(&self, server_id: &str) -> Option<HealthState> {
        self.records.read().await.get(server_id).map(|r| r.state)
    }

    pub async fn is_healthy(&self, server_id: &str) -> bool {
        self.state(server_id).await == Some(HealthState::Healthy)
    }

    /// Start the periodic probe loop; false when it is already running
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return false;
        }

        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let monitor = Arc::downgrade(self);
        let every = self.config.check_interval;
        info!(interval_ms = every.as_millis() as u64, "Starting health monitor");

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        monitor.check_all().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Health monitor loop stopped");
        }));
        true
    }

    /// Stop the probe loop and wait for it to finish
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Run calls through the client with bounded concurrency.
    ///
    /// Results come back in input order; a failed call yields a failed
    /// result without affecting the others.
    pub async fn batch_execute(&self, requests: Vec<ToolCallRequest>) -> Vec<ToolCallResult> {
        let client = &self.client;
        self.batch
            .run(requests, |request| async move {
                let started = Instant::now();
                match client.call(&request).await {
                    Ok(result) => result,
                    Err(err) => ToolCallResult::failure(err, ServedBy::Primary, started.elapsed()),
                }
            })
            .await
    }
}
