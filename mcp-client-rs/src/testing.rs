//! In-memory tool servers for exercising the client and its dependents
//!
//! [`StubToolServer`] answers every tool with a JSON echo unless failures
//! are scripted, counts calls, probes and opened connections, and honours a
//! `delay_ms` argument to simulate slow round-trips.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use error_handling_rs::{Result, ToolError};

use crate::core::{Arguments, ToolConnection, ToolServer};

#[derive(Default)]
struct StubState {
    scripted_failures: Mutex<VecDeque<ToolError>>,
    persistent_failure: Mutex<Option<ToolError>>,
    responses: Mutex<HashMap<String, Value>>,
    tools: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    probe_failing: AtomicBool,
    calls: AtomicUsize,
    probes: AtomicUsize,
    connections: AtomicUsize,
    auth_refreshes: AtomicUsize,
}

/// Scriptable in-memory [`ToolServer`]
#[derive(Clone)]
pub struct StubToolServer {
    id: String,
    state: Arc<StubState>,
}

impl StubToolServer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(StubState::default()),
        }
    }

    pub fn shared(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(id))
    }

    /// Fail the next `times` calls with `error`
    pub fn fail_next(&self, error: ToolError, times: usize) {
        let mut failures = lock(&self.state.scripted_failures);
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    /// Fail every call (and probe) until [`StubToolServer::recover`]
    pub fn fail_always(&self, error: ToolError) {
        *lock(&self.state.persistent_failure) = Some(error);
        self.state.probe_failing.store(true, Ordering::SeqCst);
    }

    /// Clear all scripted failures
    pub fn recover(&self) {
        lock(&self.state.scripted_failures).clear();
        *lock(&self.state.persistent_failure) = None;
        self.state.probe_failing.store(false, Ordering::SeqCst);
    }

    pub fn set_probe_failing(&self, failing: bool) {
        self.state.probe_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_response(&self, tool_name: &str, payload: Value) {
        lock(&self.state.responses).insert(tool_name.to_string(), payload);
    }

    pub fn set_tools(&self, tools: &[&str]) {
        *lock(&self.state.tools) = tools.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.state.delay) = delay;
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn auth_refreshes(&self) -> usize {
        self.state.auth_refreshes.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct StubConnection {
    state: Arc<StubState>,
}

#[async_trait]
impl ToolConnection for StubConnection {
    async fn call(&self, tool_name: &str, arguments: &Arguments) -> Result<Value> {
        let call_number = self.state.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let mut delay = *lock(&self.state.delay);
        if let Some(ms) = arguments.get("delay_ms").and_then(Value::as_u64) {
            delay = Duration::from_millis(ms);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = lock(&self.state.scripted_failures).pop_front() {
            return Err(error);
        }
        if let Some(error) = lock(&self.state.persistent_failure).clone() {
            return Err(error);
        }

        let payload = lock(&self.state.responses)
            .get(tool_name)
            .cloned()
            .unwrap_or_else(|| {
                json!({
                    "status": "success",
                    "tool": tool_name,
                    "arguments": arguments,
                    "call": call_number,
                })
            });
        Ok(payload)
    }
}

#[async_trait]
impl ToolServer for StubToolServer {
    fn server_id(&self) -> &str {
        &self.id
    }

    async fn open_connection(&self) -> Result<Box<dyn ToolConnection>> {
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubConnection {
            state: Arc::clone(&self.state),
        }))
    }

    async fn probe(&self) -> Result<()> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        if self.state.probe_failing.load(Ordering::SeqCst) {
            Err(ToolError::connection_refused(format!("{} is down", self.id)))
        } else {
            Ok(())
        }
    }

    async fn list_tools(&self) -> Result<Vec<String>> {
        Ok(lock(&self.state.tools).clone())
    }

    async fn refresh_auth(&self) -> Result<()> {
        self.state.auth_refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
