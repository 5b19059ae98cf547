//! # Circuit Breaker
//!
//! Per-component circuit breakers guarding calls to remote dependencies.
//!
//! - CLOSED counts consecutive failures and opens at the threshold
//! - OPEN short-circuits every call until the cooldown elapses
//! - HALF_OPEN admits exactly one probe, gated by a compare-and-set flag
//!
//! A call obtains a [`CallPermit`] from [`CircuitBreaker::try_acquire`] and
//! settles it with [`CallPermit::succeed`] or [`CallPermit::fail`], or hands it
//! back untouched with [`CallPermit::release`]. A probe
//! permit dropped without being settled counts as a failed probe so the
//! breaker can never stay stuck in HALF_OPEN.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::ToolError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, a single probe allowed
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration shared by every breaker of a registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent OPEN before a probe is admitted
    pub cooldown: Duration,
    /// Factor applied to the cooldown each time a probe fails
    pub cooldown_multiplier: f64,
    /// Upper bound for the extended cooldown
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            cooldown_multiplier: 1.0,
            max_cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    cooldown: Duration,
    total_successes: u64,
    total_failures: u64,
}

/// Read-only view of one breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub component: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_ms: u64,
    pub half_open_probe_in_flight: bool,
    /// Number of times the circuit has opened
    pub trips: u64,
    pub short_circuited: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Circuit breaker for a single component
#[derive(Debug)]
pub struct CircuitBreaker {
    component: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    probe_in_flight: AtomicBool,
    trips: AtomicU64,
    short_circuited: AtomicU64,
}

impl CircuitBreaker {
    pub fn new<S: Into<String>>(component: S, config: CircuitBreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            component: component.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                opened_at_wall: None,
                cooldown,
                total_successes: 0,
                total_failures: 0,
            }),
            probe_in_flight: AtomicBool::new(false),
            trips: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::SeqCst)
    }

    /// Ask permission to call the guarded component.
    ///
    /// Fails with [`ToolError::CircuitOpen`] while OPEN, and for every caller
    /// other than the single probe while HALF_OPEN.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, ToolError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(Arc::clone(self), false)),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= inner.cooldown);
                if cooled && self.begin_probe() {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    debug!(component = %self.component, "Admitting half-open probe");
                    Ok(CallPermit::new(Arc::clone(self), true))
                } else {
                    Err(self.short_circuit())
                }
            }
            CircuitState::HalfOpen => {
                if self.begin_probe() {
                    Ok(CallPermit::new(Arc::clone(self), true))
                } else {
                    Err(self.short_circuit())
                }
            }
        }
    }

    /// Force the circuit OPEN regardless of the failure count
    pub fn trip(&self, reason: &str) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            warn!(component = %self.component, reason, "Circuit forced open");
            self.open(&mut inner);
        }
    }

    /// Administrative reset back to CLOSED
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.cooldown = self.config.cooldown;
        self.transition(&mut inner, CircuitState::Closed);
        self.probe_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            component: self.component.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            opened_at: inner.opened_at_wall,
            cooldown_ms: inner.cooldown.as_millis() as u64,
            half_open_probe_in_flight: self.probe_in_flight.load(Ordering::SeqCst),
            trips: self.trips.load(Ordering::SeqCst),
            short_circuited: self.short_circuited.load(Ordering::SeqCst),
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_probe(&self) -> bool {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn short_circuit(&self) -> ToolError {
        self.short_circuited.fetch_add(1, Ordering::Relaxed);
        counter!("circuit_breaker_short_circuits", 1, "component" => self.component.clone());
        ToolError::circuit_open(self.component.clone())
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        if probe {
            self.probe_in_flight.store(false, Ordering::SeqCst);
            if inner.state == CircuitState::HalfOpen {
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.opened_at_wall = None;
                inner.cooldown = self.config.cooldown;
                self.transition(&mut inner, CircuitState::Closed);
            }
        } else if inner.state == CircuitState::Closed {
            inner.failure_count = 0;
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        if probe {
            self.probe_in_flight.store(false, Ordering::SeqCst);
            if inner.state == CircuitState::HalfOpen {
                let extended = inner.cooldown.mul_f64(self.config.cooldown_multiplier.max(1.0));
                inner.cooldown = extended.min(self.config.max_cooldown.max(self.config.cooldown));
                self.open(&mut inner);
            }
        } else if inner.state == CircuitState::Closed {
            inner.failure_count += 1;
            if inner.failure_count >= self.config.failure_threshold {
                self.open(&mut inner);
            }
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        inner.opened_at = Some(Instant::now());
        inner.opened_at_wall = Some(Utc::now());
        self.trips.fetch_add(1, Ordering::SeqCst);
        counter!("circuit_breaker_trips", 1, "component" => self.component.clone());
        self.transition(inner, CircuitState::Open);
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        gauge!("circuit_breaker_state", to.gauge_value(), "component" => self.component.clone());
        if from != to {
            info!(
                component = %self.component,
                from = %from,
                to = %to,
                failures = inner.failure_count,
                "Circuit breaker state changed"
            );
        }
    }
}

/// Permission to perform one guarded call
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    fn new(breaker: Arc<CircuitBreaker>, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// True for the single HALF_OPEN trial call
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }

    /// Give the permit back without an outcome, for calls that never
    /// reached the component. A released probe leaves the circuit HALF_OPEN.
    pub fn release(mut self) {
        self.settled = true;
        if self.probe {
            self.breaker.probe_in_flight.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            debug!(component = %self.breaker.component, "Probe abandoned, reopening circuit");
            self.breaker.on_failure(true);
        }
    }
}

/// Lazily populated breaker per component name
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// The breaker for `component`, created CLOSED on first use
    pub fn get(&self, component: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(component)
        {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(component.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(component, self.config.clone()))),
        )
    }

    /// Reset one breaker; returns false when the component is unknown
    pub fn reset(&self, component: &str) -> bool {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        match breakers.get(component) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Snapshots of every known breaker, ordered by component name
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut snapshots: Vec<CircuitSnapshot> =
            breakers.values().map(|breaker| breaker.snapshot()).collect();
        snapshots.sort_by(|a, b| a.component.cmp(&b.component));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker(threshold: u32, cooldown: Duration) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "primary",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_opens_exactly_once_at_threshold() {
        let breaker = breaker(5, Duration::from_secs(60));
        let underlying_calls = AtomicUsize::new(0);

        for i in 0..12 {
            match breaker.try_acquire() {
                Ok(permit) => {
                    underlying_calls.fetch_add(1, Ordering::SeqCst);
                    permit.fail();
                }
                Err(err) => {
                    assert!(i >= 5, "call {} short-circuited too early", i);
                    assert!(err.is_short_circuit());
                }
            }
            if i == 3 {
                assert_eq!(breaker.state(), CircuitState::Closed);
            }
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.trips(), 1);
        assert_eq!(underlying_calls.load(Ordering::SeqCst), 5);
        assert_eq!(breaker.snapshot().short_circuited, 7);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = breaker(3, Duration::from_secs(60));
        for _ in 0..2 {
            breaker.try_acquire().unwrap().fail();
        }
        breaker.try_acquire().unwrap().succeed();
        for _ in 0..2 {
            breaker.try_acquire().unwrap().fail();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 2);
    }

    #[test]
    fn test_released_probe_keeps_half_open() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.try_acquire().unwrap().fail();
        std::thread::sleep(Duration::from_millis(20));

        breaker.try_acquire().unwrap().release();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().total_successes, 0);

        let next = breaker.try_acquire().unwrap();
        assert!(next.is_probe());
        next.fail();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.try_acquire().unwrap().fail();
        assert!(breaker.try_acquire().is_err());

        std::thread::sleep(Duration::from_millis(20));
        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        probe.succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
        assert!(!breaker.try_acquire().unwrap().is_probe());
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let breaker = Arc::new(CircuitBreaker::new(
            "primary",
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(10),
                cooldown_multiplier: 2.0,
                max_cooldown: Duration::from_millis(30),
            },
        ));
        breaker.try_acquire().unwrap().fail();
        std::thread::sleep(Duration::from_millis(20));

        breaker.try_acquire().unwrap().fail();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().cooldown_ms, 20);
        assert_eq!(breaker.trips(), 2);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_abandoned_probe_reopens() {
        let breaker = breaker(1, Duration::from_millis(5));
        breaker.try_acquire().unwrap().fail();
        std::thread::sleep(Duration::from_millis(10));

        let probe = breaker.try_acquire().unwrap();
        drop(probe);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.snapshot().half_open_probe_in_flight);
    }

    #[tokio::test]
    async fn test_half_open_admits_a_single_concurrent_probe() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.try_acquire().unwrap().fail();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let admitted = Arc::new(AtomicUsize::new(0));
        let rejected = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let breaker = Arc::clone(&breaker);
            let admitted = Arc::clone(&admitted);
            let rejected = Arc::clone(&rejected);
            handles.push(tokio::spawn(async move {
                match breaker.try_acquire() {
                    Ok(permit) => {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        permit.succeed();
                    }
                    Err(err) => {
                        assert!(err.is_short_circuit());
                        rejected.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for result in futures::future::join_all(handles).await {
            result.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(rejected.load(Ordering::SeqCst), 15);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trip_and_reset() {
        let breaker = breaker(5, Duration::from_secs(60));
        breaker.trip("resource exhausted");
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_registry_shares_breakers_per_component() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry.get("primary").try_acquire().unwrap().fail();
        assert_eq!(registry.get("primary").state(), CircuitState::Open);
        assert_eq!(registry.get("dynamic").state(), CircuitState::Closed);

        let names: Vec<String> = registry.snapshot().into_iter().map(|s| s.component).collect();
        assert_eq!(names, vec!["dynamic".to_string(), "primary".to_string()]);

        assert!(registry.reset("primary"));
        assert!(!registry.reset("missing"));
        assert_eq!(registry.get("primary").state(), CircuitState::Closed);
    }
}
