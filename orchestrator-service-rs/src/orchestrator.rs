//! The orchestrator
//!
//! Routes every tool call according to the current [`ExecutionMode`]:
//!
//! - PRIMARY: through the enhanced client, gated by the target server's
//!   circuit breaker, failing over to the fallback handler per request
//! - FALLBACK / DEGRADED: straight to the fallback handler
//! - RECOVERY: one trial call at a time through the primary path; other
//!   calls keep using the fallback handler until the trial settles
//!
//! The mode lives behind a single async lock and changes only through
//! [`Orchestrator::transition`], which also appends to the history.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use error_handling_rs::{CircuitState, ErrorRecoveryManager, RecoveryAction, ToolError};
use mcp_client::{CacheKey, EnhancedClient, ServedBy, ToolCallRequest, ToolCallResult};

use crate::batch::BatchOutcome;
use crate::config::{ConfigError, OrchestratorConfig};
use crate::fallback::FallbackHandler;
use crate::health::{HealthEvent, HealthMonitor, HealthState};
use crate::mode::{ExecutionMode, LastKnownGood, ModeMetrics, ModeState, ModeTransition};
use crate::status::{ModeMetricsSummary, OrchestratorStatus, RECENT_TRANSITIONS};

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Component name used for fallback store failures
pub const FALLBACK_COMPONENT: &str = "fallback";

/// What a caller gets back for one request
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub tool_name: String,
    pub result: ToolCallResult,
    /// Mode in effect once the request was handled
    pub mode: ExecutionMode,
    /// True when the payload is a stale last-known-good answer
    pub degraded: bool,
    /// Execution paths tried
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_for_secs: Option<u64>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.result.success
    }

    pub fn served_by(&self) -> ServedBy {
        self.result.served_by
    }

    pub fn error(&self) -> Option<&ToolError> {
        self.result.error.as_ref()
    }
}

impl BatchOutcome for ExecutionResult {
    fn is_success(&self) -> bool {
        self.result.success
    }
}

/// Per-request bookkeeping
struct Call<'a> {
    request: &'a ToolCallRequest,
    started: Instant,
    attempts: u32,
}

/// Clears the recovery trial flag when the trial settles or is cancelled
struct TrialGuard<'a>(&'a AtomicBool);

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    client: Arc<EnhancedClient>,
    monitor: Arc<HealthMonitor>,
    fallback: Arc<FallbackHandler>,
    recovery: Arc<ErrorRecoveryManager>,
    state: RwLock<ModeState>,
    metrics: Mutex<BTreeMap<ExecutionMode, ModeMetrics>>,
    last_known_good: Mutex<LastKnownGood>,
    trial_in_flight: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        client: Arc<EnhancedClient>,
        fallback: FallbackHandler,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Lazy::force(&START_TIME);

        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&client), config.health_config()));
        let recovery = Arc::new(ErrorRecoveryManager::new(config.recovery_config()));
        Ok(Self {
            state: RwLock::new(ModeState::new(config.mode_history_cap)),
            metrics: Mutex::new(BTreeMap::new()),
            last_known_good: Mutex::new(LastKnownGood::new(
                config.last_known_good_cap,
                config.last_known_good_max_age,
            )),
            trial_in_flight: AtomicBool::new(false),
            listener: Mutex::new(None),
            sweeper: Mutex::new(None),
            config,
            client,
            monitor,
            fallback: Arc::new(fallback),
            recovery,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<EnhancedClient> {
        &self.client
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn fallback(&self) -> &Arc<FallbackHandler> {
        &self.fallback
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoveryManager> {
        &self.recovery
    }

    fn primary_id(&self) -> &str {
        &self.config.primary_server_id
    }

    /// Register servers, learn routes and probe the primary once
    pub async fn initialize(&self) -> ExecutionMode {
        self.monitor.register_all().await;
        let routes = self.client.discover_routes().await;
        debug!(routes, "Discovered tool routes");

        let state = self.monitor.check_server(self.primary_id()).await;
        if state != HealthState::Healthy {
            warn!(server_id = self.primary_id(), state = %state, "Primary server failed its startup probe");
            self.transition(&[ExecutionMode::Primary], ExecutionMode::Fallback, "startup probe failed")
                .await;
        }

        let mode = self.mode().await;
        info!(mode = %mode, "Orchestrator initialized");
        mode
    }

    /// Start the health loop, the event listener and the cache sweeper
    pub fn start(self: &Arc<Self>) {
        self.monitor.start();
        self.spawn_event_listener();

        let mut sweeper = lock(&self.sweeper);
        if sweeper.is_none() && !self.config.cache_ttl.is_zero() {
            let every = self.config.cache_ttl.max(Duration::from_secs(1));
            *sweeper = Some(self.client.cache().spawn_sweeper(every));
        }
    }

    /// React to health events until shutdown.
    ///
    /// The loop also re-checks the recovery rule on every health interval,
    /// since a server that is already HEALTHY emits no further events.
    pub fn spawn_event_listener(self: &Arc<Self>) -> bool {
        let mut listener = lock(&self.listener);
        if listener.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return false;
        }

        let mut events = self.monitor.subscribe();
        let orchestrator = Arc::downgrade(self);
        let every = self.config.health_check_interval;
        *listener = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => {
                            let Some(orchestrator) = orchestrator.upgrade() else { break };
                            orchestrator.on_health_event(&event).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Health event listener lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        let Some(orchestrator) = orchestrator.upgrade() else { break };
                        orchestrator.check_recovery().await;
                    }
                }
            }
            debug!("Health event listener stopped");
        }));
        true
    }

    async fn on_health_event(&self, event: &HealthEvent) {
        if event.server_id != self.primary_id() {
            return;
        }
        match event.new_state {
            HealthState::Unhealthy => {
                self.transition(
                    &[ExecutionMode::Primary, ExecutionMode::Recovery],
                    ExecutionMode::Fallback,
                    "primary server unhealthy",
                )
                .await;
            }
            HealthState::Healthy => {
                self.check_recovery().await;
            }
            HealthState::Degraded => {}
        }
    }

    /// Enter RECOVERY once the recovery window has passed since entering
    /// FALLBACK or DEGRADED and the primary has answered a probe since then
    pub async fn check_recovery(&self) -> bool {
        let (mode, since, entered_at) = {
            let state = self.state.read().await;
            (state.current, state.entered, state.entered_at)
        };
        if !matches!(mode, ExecutionMode::Fallback | ExecutionMode::Degraded)
            || since.elapsed() < self.config.recovery_window
        {
            return false;
        }
        let probed_healthy = self.monitor.record(self.primary_id()).await.map_or(false, |record| {
            record.state == HealthState::Healthy && record.last_success_at.map_or(false, |at| at > entered_at)
        });
        if !probed_healthy {
            return false;
        }
        self.transition(
            &[ExecutionMode::Fallback, ExecutionMode::Degraded],
            ExecutionMode::Recovery,
            "primary healthy after recovery window",
        )
        .await
    }

    /// Apply a transition if the current mode is one of `expected`.
    ///
    /// Returns false when the mode already moved on, so concurrent callers
    /// reacting to the same condition produce a single history entry.
    pub async fn transition(&self, expected: &[ExecutionMode], to: ExecutionMode, reason: &str) -> bool {
        let transition = {
            let mut state = self.state.write().await;
            if state.current == to || !expected.contains(&state.current) {
                return false;
            }
            state.enter(to, reason)
        };

        if to == ExecutionMode::Primary {
            info!(from = %transition.from, to = %to, reason, "Mode transition");
        } else {
            warn!(from = %transition.from, to = %to, reason, "Mode transition");
        }
        counter!(
            "mcp_mode_transitions",
            1,
            "from" => transition.from.as_str(),
            "to" => to.as_str()
        );
        gauge!("mcp_orchestrator_mode", to.gauge_value());
        true
    }

    pub async fn mode(&self) -> ExecutionMode {
        self.state.read().await.current
    }

    pub async fn mode_history(&self) -> Vec<ModeTransition> {
        self.state.read().await.history.iter().cloned().collect()
    }

    pub fn mode_metrics(&self) -> BTreeMap<ExecutionMode, ModeMetrics> {
        lock(&self.metrics).clone()
    }

    /// Execute one request in the current mode
    pub async fn execute(&self, request: &ToolCallRequest) -> ExecutionResult {
        let started = Instant::now();
        let mut mode = self.mode().await;
        if matches!(mode, ExecutionMode::Fallback | ExecutionMode::Degraded) && self.check_recovery().await {
            mode = ExecutionMode::Recovery;
        }

        let mut call = Call {
            request,
            started,
            attempts: 0,
        };
        let target = self.client.server_for(request.tool_name());
        let outcome = match (mode, target) {
            (_, None) => self.serve_fallback(&mut call).await,
            (ExecutionMode::Primary, Some(server_id)) => self.serve_primary(&mut call, &server_id, false).await,
            (ExecutionMode::Recovery, Some(server_id)) if server_id == self.primary_id() => {
                match self.begin_trial() {
                    Some(_guard) => {
                        info!(tool = request.tool_name(), "Running recovery trial");
                        self.serve_primary(&mut call, &server_id, true).await
                    }
                    None => self.serve_fallback(&mut call).await,
                }
            }
            (ExecutionMode::Recovery, Some(server_id)) => self.serve_primary(&mut call, &server_id, false).await,
            // Tools the fallback cannot serve stay on their own server as
            // long as it is not the primary.
            (_, Some(server_id))
                if server_id != self.primary_id() && !self.fallback.supports(request.tool_name()) =>
            {
                self.serve_primary(&mut call, &server_id, false).await
            }
            (_, Some(_)) => self.serve_fallback(&mut call).await,
        };

        self.record_metrics(mode, &outcome, started.elapsed());
        outcome
    }

    /// Execute requests with the monitor's bounded concurrency, in order
    pub async fn batch_execute(&self, requests: Vec<ToolCallRequest>) -> Vec<ExecutionResult> {
        self.monitor
            .batch()
            .run(requests, |request| async move { self.execute(&request).await })
            .await
    }

    fn begin_trial(&self) -> Option<TrialGuard<'_>> {
        self.trial_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| TrialGuard(&self.trial_in_flight))
    }

    async fn serve_primary(&self, call: &mut Call<'_>, server_id: &str, trial: bool) -> ExecutionResult {
        let request = call.request;
        let on_primary = server_id == self.primary_id();
        let breaker = self.recovery.breaker(server_id);
        call.attempts += 1;

        if trial {
            // A trial must reach the server, not the cache.
            self.client
                .cache()
                .invalidate(&CacheKey::new(request.tool_name(), request.arguments()));
        } else if let Some(result) = self.client.cached(request) {
            // Cache hits settle nothing about the server.
            return self.finish(call, result, false, None).await;
        }

        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(short_circuit) => {
                debug!(server_id, tool = request.tool_name(), "Primary path short-circuited");
                if on_primary {
                    let (from, reason) = if trial {
                        (ExecutionMode::Recovery, "recovery trial short-circuited")
                    } else {
                        (ExecutionMode::Primary, "circuit breaker open")
                    };
                    self.transition(&[from], ExecutionMode::Fallback, reason).await;
                }
                return self
                    .fail_over(call, server_id, short_circuit, RecoveryAction::Fallback)
                    .await;
            }
        };

        match self.client.call_on(server_id, request).await {
            Ok(result) if result.served_by == ServedBy::Cache => {
                permit.release();
                self.finish(call, result, false, None).await
            }
            Ok(result) => {
                permit.succeed();
                self.remember(request, &result);
                if on_primary {
                    if trial {
                        self.transition(&[ExecutionMode::Recovery], ExecutionMode::Primary, "recovery trial succeeded")
                            .await;
                    } else {
                        self.clear_errors().await;
                    }
                }
                self.finish(call, result, false, None).await
            }
            Err(err) if err.is_local_validation() => {
                // The server answered; the caller is at fault.
                permit.succeed();
                self.recovery.record(server_id, &err, RecoveryAction::Fail, false);
                if on_primary && trial {
                    self.transition(&[ExecutionMode::Recovery], ExecutionMode::Primary, "recovery trial answered")
                        .await;
                }
                self.failure(call, err, ServedBy::Primary).await
            }
            Err(err) => {
                permit.fail();
                let action = self.recovery.recommend(err.kind());
                warn!(
                    server_id,
                    tool = request.tool_name(),
                    kind = %err.kind(),
                    action = %action,
                    error = %err,
                    "Primary path failed"
                );
                self.apply_recovery(server_id, action, &err);

                if on_primary {
                    if trial {
                        self.transition(&[ExecutionMode::Recovery], ExecutionMode::Fallback, "recovery trial failed")
                            .await;
                    } else {
                        self.note_primary_error(breaker.state()).await;
                    }
                }
                self.fail_over(call, server_id, err, action).await
            }
        }
    }

    /// Count a primary failure and leave PRIMARY when the breaker opened or
    /// the error streak exceeded its threshold
    async fn note_primary_error(&self, breaker_state: CircuitState) {
        let errors = {
            let mut state = self.state.write().await;
            if state.current != ExecutionMode::Primary {
                return;
            }
            state.consecutive_errors += 1;
            state.consecutive_errors
        };

        if breaker_state == CircuitState::Open {
            self.transition(&[ExecutionMode::Primary], ExecutionMode::Fallback, "circuit breaker open")
                .await;
        } else if errors > self.config.consecutive_error_threshold {
            let reason = format!("{} consecutive primary errors", errors);
            self.transition(&[ExecutionMode::Primary], ExecutionMode::Fallback, &reason)
                .await;
        }
    }

    async fn clear_errors(&self) {
        if self.state.read().await.consecutive_errors == 0 {
            return;
        }
        let mut state = self.state.write().await;
        if state.current == ExecutionMode::Primary {
            state.consecutive_errors = 0;
        }
    }

    fn apply_recovery(&self, server_id: &str, action: RecoveryAction, err: &ToolError) {
        match action {
            RecoveryAction::RestartConnection => {
                self.client.restart_connections(server_id);
            }
            RecoveryAction::ClearCache => {
                self.client.clear_cache();
            }
            RecoveryAction::CircuitBreak => {
                self.recovery.breaker(server_id).trip(&err.to_string());
            }
            // Retries and the single credential refresh already happened
            // inside the client.
            RecoveryAction::Retry
            | RecoveryAction::RetryWithBackoff
            | RecoveryAction::RefreshAuth
            | RecoveryAction::Fallback
            | RecoveryAction::Fail => {}
        }
    }

    /// After a primary failure, try the fallback path for the same request
    async fn fail_over(
        &self,
        call: &mut Call<'_>,
        server_id: &str,
        primary_err: ToolError,
        action: RecoveryAction,
    ) -> ExecutionResult {
        let request = call.request;
        if !self.fallback.supports(request.tool_name()) {
            self.recovery.record(server_id, &primary_err, action, false);
            return self.failure(call, primary_err, ServedBy::Primary).await;
        }

        call.attempts += 1;
        match self.fallback.execute(request).await {
            Ok(result) => {
                self.recovery.record(server_id, &primary_err, action, true);
                self.remember(request, &result);
                info!(server_id, tool = request.tool_name(), "Served by fallback after primary failure");
                self.finish(call, result, false, None).await
            }
            Err(fallback_err) if fallback_err.is_local_validation() => {
                self.recovery.record(server_id, &primary_err, action, false);
                debug!(error = %fallback_err, "Fallback rejected the request");
                self.failure(call, primary_err, ServedBy::Primary).await
            }
            Err(fallback_err) => {
                self.recovery.record(server_id, &primary_err, action, false);
                self.record_fallback_failure(&fallback_err);
                self.degrade(call, fallback_err, "primary and fallback failed").await
            }
        }
    }

    async fn serve_fallback(&self, call: &mut Call<'_>) -> ExecutionResult {
        let request = call.request;
        call.attempts += 1;
        match self.fallback.execute(request).await {
            Ok(result) => {
                self.remember(request, &result);
                self.finish(call, result, false, None).await
            }
            Err(err) if err.is_local_validation() => self.failure(call, err, ServedBy::Fallback).await,
            Err(err) => {
                self.record_fallback_failure(&err);
                self.degrade(call, err, "fallback path failed").await
            }
        }
    }

    fn record_fallback_failure(&self, err: &ToolError) {
        let action = self.recovery.recommend(err.kind());
        self.recovery.record(FALLBACK_COMPONENT, err, action, false);
    }

    /// Enter DEGRADED and answer with the last-known-good payload if one is
    /// fresh enough, otherwise with a terminal failure
    async fn degrade(&self, call: &mut Call<'_>, err: ToolError, reason: &str) -> ExecutionResult {
        self.transition(&ExecutionMode::ALL, ExecutionMode::Degraded, reason)
            .await;

        let key = CacheKey::new(call.request.tool_name(), call.request.arguments());
        let stale = lock(&self.last_known_good).get(&key);
        match stale {
            Some((payload, age)) => {
                warn!(
                    tool = call.request.tool_name(),
                    age_secs = age.as_secs(),
                    "Serving last known good result"
                );
                counter!("mcp_degraded_responses", 1, "tool" => call.request.tool_name().to_string());
                let result = ToolCallResult::success(payload, ServedBy::Cache, call.started.elapsed());
                self.finish(call, result, true, Some(age.as_secs())).await
            }
            None => {
                error!(tool = call.request.tool_name(), error = %err, "No execution path succeeded");
                self.failure(call, err, ServedBy::Fallback).await
            }
        }
    }

    fn remember(&self, request: &ToolCallRequest, result: &ToolCallResult) {
        if !result.success {
            return;
        }
        if let Some(payload) = &result.payload {
            let key = CacheKey::new(request.tool_name(), request.arguments());
            lock(&self.last_known_good).insert(key, payload.clone());
        }
    }

    async fn finish(
        &self,
        call: &Call<'_>,
        result: ToolCallResult,
        degraded: bool,
        stale_for_secs: Option<u64>,
    ) -> ExecutionResult {
        ExecutionResult {
            request_id: Uuid::new_v4(),
            tool_name: call.request.tool_name().to_string(),
            result,
            mode: self.mode().await,
            degraded,
            attempts: call.attempts,
            stale_for_secs,
        }
    }

    async fn failure(&self, call: &Call<'_>, err: ToolError, served_by: ServedBy) -> ExecutionResult {
        let result = ToolCallResult::failure(err, served_by, call.started.elapsed());
        self.finish(call, result, false, None).await
    }

    fn record_metrics(&self, mode: ExecutionMode, outcome: &ExecutionResult, latency: Duration) {
        let success = outcome.is_success();
        lock(&self.metrics).entry(mode).or_default().record(success, latency);
        counter!(
            "mcp_mode_executions",
            1,
            "mode" => mode.as_str(),
            "outcome" => if success { "success" } else { "failure" }
        );
        histogram!("mcp_mode_latency_ms", latency.as_secs_f64() * 1000.0, "mode" => mode.as_str());
    }

    /// Reset one breaker; administrative
    pub fn reset_breaker(&self, component: &str) -> bool {
        self.recovery.reset_breaker(component)
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let (mode, entered_at, entered, consecutive_errors, recent_transitions, history_len, total_transitions) = {
            let state = self.state.read().await;
            (
                state.current,
                state.entered_at,
                state.entered,
                state.consecutive_errors,
                state.recent(RECENT_TRANSITIONS),
                state.history.len(),
                state.transitions,
            )
        };

        let mode_metrics = lock(&self.metrics)
            .iter()
            .map(|(mode, metrics)| (*mode, ModeMetricsSummary::from(metrics)))
            .collect();
        let recovery = self.recovery.statistics();
        let servers = self.monitor.records().await;
        let last_known_good_entries = lock(&self.last_known_good).len();

        OrchestratorStatus {
            mode,
            entered_at,
            time_in_mode_secs: entered.elapsed().as_secs_f64(),
            consecutive_errors,
            recovery_trial_in_flight: self.trial_in_flight.load(Ordering::SeqCst),
            recent_transitions,
            history_len,
            total_transitions,
            mode_metrics,
            servers,
            circuit_breakers: recovery.circuit_breakers.clone(),
            recovery,
            client: self.client.stats(),
            fallback: self.fallback.stats(),
            batch: self.monitor.batch().stats(),
            last_known_good_entries,
            uptime_secs: START_TIME.elapsed().as_secs(),
            timestamp: Utc::now(),
        }
    }

    /// Stop the background tasks
    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        for slot in [&self.listener, &self.sweeper] {
            if let Some(handle) = lock(slot).take() {
                handle.abort();
            }
        }
        info!("Orchestrator stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
