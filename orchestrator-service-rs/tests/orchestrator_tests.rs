// End-to-end tests for the orchestrator against in-memory tool servers
// and an in-memory fallback store

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use error_handling_rs::{CircuitState, ErrorKind, Result as ToolResult, ToolError};
use mcp_client::testing::StubToolServer;
use mcp_client::{EnhancedClient, ServedBy, ToolCallRequest};
use orchestrator_service::{
    DataStore, ExecutionMode, FallbackHandler, FallbackQuery, Orchestrator, OrchestratorConfig, Row,
};

#[derive(Default)]
struct MemoryStore {
    queries: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl DataStore for MemoryStore {
    fn query(&self, query: &FallbackQuery) -> ToolResult<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ToolError::connection_refused("store offline"));
        }
        let mut row = Row::new();
        row.insert("operation".to_string(), json!(query.operation().name()));
        Ok(vec![row])
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    primary: Arc<StubToolServer>,
    store: Arc<MemoryStore>,
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        call_timeout: Duration::from_secs(2),
        max_retries: 0,
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(5),
        breaker_failure_threshold: 2,
        breaker_cooldown: Duration::from_millis(50),
        recovery_window: Duration::from_millis(100),
        health_check_interval: Duration::from_secs(60),
        ..OrchestratorConfig::default()
    }
}

fn harness_with(config: OrchestratorConfig, extra: Option<Arc<StubToolServer>>) -> Harness {
    let primary = StubToolServer::shared(config.primary_server_id.clone());
    let mut builder = EnhancedClient::builder()
        .config(config.client_config())
        .server(primary.clone());
    if let Some(server) = extra {
        builder = builder.server(server).route("text2sql", "dynamic");
    }
    let store = Arc::new(MemoryStore::default());
    let fallback = FallbackHandler::new(store.clone());
    let orchestrator = Orchestrator::new(config, Arc::new(builder.build()), fallback).unwrap();
    Harness {
        orchestrator: Arc::new(orchestrator),
        primary,
        store,
    }
}

fn harness() -> Harness {
    harness_with(test_config(), None)
}

fn request(tool: &str, arguments: Value) -> ToolCallRequest {
    ToolCallRequest::from_value(tool, arguments).unwrap()
}

fn products(n: u64) -> ToolCallRequest {
    request("list_products", json!({ "n": n }))
}

fn reasons(history: &[orchestrator_service::ModeTransition]) -> Vec<String> {
    history.iter().map(|t| t.reason.clone()).collect()
}

async fn wait_for_mode(orchestrator: &Orchestrator, mode: ExecutionMode) -> bool {
    for _ in 0..200 {
        if orchestrator.mode().await == mode {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_primary_fallback_recovery_cycle() {
    let h = harness();
    assert_eq!(h.orchestrator.initialize().await, ExecutionMode::Primary);

    let ok = h.orchestrator.execute(&products(1)).await;
    assert!(ok.is_success());
    assert_eq!(ok.served_by(), ServedBy::Primary);
    assert_eq!(ok.mode, ExecutionMode::Primary);

    h.primary.fail_always(ToolError::timeout("primary stalled"));

    // First failure is answered by the fallback without leaving PRIMARY.
    let first = h.orchestrator.execute(&products(2)).await;
    assert!(first.is_success());
    assert_eq!(first.served_by(), ServedBy::Fallback);
    assert_eq!(first.attempts, 2);
    assert_eq!(first.mode, ExecutionMode::Primary);

    // Second failure opens the breaker.
    let second = h.orchestrator.execute(&products(3)).await;
    assert!(second.is_success());
    assert_eq!(second.mode, ExecutionMode::Fallback);

    let calls_before = h.primary.call_count();
    let in_fallback = h.orchestrator.execute(&products(4)).await;
    assert_eq!(in_fallback.served_by(), ServedBy::Fallback);
    assert_eq!(h.primary.call_count(), calls_before);
    assert_eq!(h.store.queries(), 3);

    h.primary.recover();
    h.orchestrator.monitor().check_server("primary").await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let trial = h.orchestrator.execute(&products(5)).await;
    assert!(trial.is_success());
    assert_eq!(trial.served_by(), ServedBy::Primary);
    assert_eq!(trial.mode, ExecutionMode::Primary);

    let history = h.orchestrator.mode_history().await;
    assert_eq!(
        reasons(&history),
        vec![
            "circuit breaker open",
            "primary healthy after recovery window",
            "recovery trial succeeded",
        ]
    );
    assert_eq!(history[1].to, ExecutionMode::Recovery);

    let metrics = h.orchestrator.mode_metrics();
    assert_eq!(metrics[&ExecutionMode::Primary].executions, 3);
    assert_eq!(metrics[&ExecutionMode::Fallback].executions, 1);
    assert_eq!(metrics[&ExecutionMode::Recovery].successes, 1);
}

#[tokio::test]
async fn test_failed_trial_returns_to_fallback() {
    let h = harness();
    h.orchestrator.initialize().await;
    h.primary.fail_always(ToolError::timeout("primary stalled"));

    h.orchestrator.execute(&products(1)).await;
    h.orchestrator.execute(&products(2)).await;
    assert_eq!(h.orchestrator.mode().await, ExecutionMode::Fallback);

    // Probes answer again while tool calls keep failing.
    h.primary.set_probe_failing(false);
    h.orchestrator.monitor().check_server("primary").await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let trial = h.orchestrator.execute(&products(3)).await;

    assert!(trial.is_success());
    assert_eq!(trial.served_by(), ServedBy::Fallback);
    assert_eq!(trial.mode, ExecutionMode::Fallback);

    let history = h.orchestrator.mode_history().await;
    assert_eq!(history.last().unwrap().reason, "recovery trial failed");
    assert_eq!(history.last().unwrap().from, ExecutionMode::Recovery);

    let status = h.orchestrator.status().await;
    assert!(!status.recovery_trial_in_flight);
}

#[tokio::test]
async fn test_recovery_waits_for_a_fresh_health_check() {
    let h = harness();
    h.orchestrator.initialize().await;
    h.primary.fail_always(ToolError::timeout("primary stalled"));
    h.orchestrator.execute(&products(1)).await;
    h.orchestrator.execute(&products(2)).await;
    assert_eq!(h.orchestrator.mode().await, ExecutionMode::Fallback);

    // The only healthy record predates FALLBACK.
    h.primary.recover();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!h.orchestrator.check_recovery().await);

    let calls_before = h.primary.call_count();
    let still_fallback = h.orchestrator.execute(&products(3)).await;
    assert_eq!(still_fallback.served_by(), ServedBy::Fallback);
    assert_eq!(still_fallback.mode, ExecutionMode::Fallback);
    assert_eq!(h.primary.call_count(), calls_before);

    h.orchestrator.monitor().check_server("primary").await;
    assert!(h.orchestrator.check_recovery().await);
    assert_eq!(h.orchestrator.mode().await, ExecutionMode::Recovery);
}

#[tokio::test]
async fn test_cache_hits_do_not_close_a_half_open_breaker() {
    let dynamic = StubToolServer::shared("dynamic");
    let h = harness_with(test_config(), Some(dynamic.clone()));
    h.orchestrator.initialize().await;

    let cached = request("text2sql", json!({ "q": 1 }));
    assert_eq!(h.orchestrator.execute(&cached).await.served_by(), ServedBy::Primary);

    dynamic.fail_always(ToolError::timeout("dynamic stalled"));
    h.orchestrator.execute(&request("text2sql", json!({ "q": 2 }))).await;
    h.orchestrator.execute(&request("text2sql", json!({ "q": 3 }))).await;
    let breaker = h.orchestrator.recovery().breaker("dynamic");
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let calls_before = dynamic.call_count();
    let hit = h.orchestrator.execute(&cached).await;
    assert!(hit.is_success());
    assert_eq!(hit.served_by(), ServedBy::Cache);
    assert_eq!(dynamic.call_count(), calls_before);
    assert_ne!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.snapshot().total_successes, 1);

    // The next real call is the half-open trial and fails.
    let miss = h.orchestrator.execute(&request("text2sql", json!({ "q": 4 }))).await;
    assert!(!miss.is_success());
    assert_eq!(dynamic.call_count(), calls_before + 1);
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn test_cache_hits_do_not_reset_the_error_streak() {
    let config = OrchestratorConfig {
        breaker_failure_threshold: 10,
        consecutive_error_threshold: 3,
        ..test_config()
    };
    let h = harness_with(config, None);
    h.orchestrator.initialize().await;

    let customers = request("list_customers", json!({ "limit": 5 }));
    assert_eq!(h.orchestrator.execute(&customers).await.served_by(), ServedBy::Primary);
    h.primary.fail_always(ToolError::timeout("primary stalled"));

    for order_id in 1..=3u64 {
        let failed = h
            .orchestrator
            .execute(&request("get_order_details", json!({ "order_id": order_id })))
            .await;
        assert_eq!(failed.served_by(), ServedBy::Fallback);
        let hit = h.orchestrator.execute(&customers).await;
        assert_eq!(hit.served_by(), ServedBy::Cache);
        assert_eq!(h.orchestrator.mode().await, ExecutionMode::Primary);
    }

    h.orchestrator
        .execute(&request("get_order_details", json!({ "order_id": 4 })))
        .await;
    assert_eq!(h.orchestrator.mode().await, ExecutionMode::Fallback);
    let history = h.orchestrator.mode_history().await;
    assert_eq!(reasons(&history), vec!["4 consecutive primary errors"]);

    let breaker = h.orchestrator.recovery().breaker("primary").snapshot();
    assert_eq!(breaker.failure_count, 4);
    assert_eq!(breaker.state, CircuitState::Closed);
}

#[tokio::test]
async fn test_expired_credentials_refresh_only_once() {
    let h = harness();
    h.orchestrator.initialize().await;
    h.primary.fail_always(ToolError::authentication("token expired"));

    let result = h.orchestrator.execute(&products(1)).await;
    assert!(result.is_success());
    assert_eq!(result.served_by(), ServedBy::Fallback);
    assert_eq!(h.primary.auth_refreshes(), 1);
    assert_eq!(h.primary.call_count(), 2);
}

#[tokio::test]
async fn test_degraded_serves_last_known_good() {
    let h = harness();
    h.orchestrator.initialize().await;

    let fresh = h.orchestrator.execute(&products(1)).await;
    assert!(fresh.is_success());

    h.primary.fail_always(ToolError::timeout("primary stalled"));
    h.store.set_failing(true);
    h.orchestrator.client().clear_cache();

    let stale = h.orchestrator.execute(&products(1)).await;
    assert!(stale.is_success());
    assert!(stale.degraded);
    assert_eq!(stale.served_by(), ServedBy::Cache);
    assert_eq!(stale.stale_for_secs, Some(0));
    assert_eq!(stale.mode, ExecutionMode::Degraded);
    assert_eq!(stale.result.payload, fresh.result.payload);

    let unknown = h.orchestrator.execute(&products(99)).await;
    assert!(!unknown.is_success());
    assert!(!unknown.degraded);
    assert_eq!(unknown.error().unwrap().kind(), ErrorKind::ConnectionRefused);

    let history = h.orchestrator.mode_history().await;
    assert_eq!(reasons(&history), vec!["primary and fallback failed"]);
    assert_eq!(h.orchestrator.status().await.last_known_good_entries, 1);
}

#[tokio::test]
async fn test_startup_probe_failure_enters_fallback() {
    let h = harness();
    h.primary.set_probe_failing(true);

    assert_eq!(h.orchestrator.initialize().await, ExecutionMode::Fallback);
    let history = h.orchestrator.mode_history().await;
    assert_eq!(reasons(&history), vec!["startup probe failed"]);

    // The primary never became healthy, so the window alone does not recover.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!h.orchestrator.check_recovery().await);
    assert_eq!(h.orchestrator.mode().await, ExecutionMode::Fallback);
}

#[tokio::test]
async fn test_fallback_rejects_invalid_requests_without_store_access() {
    let h = harness();
    h.primary.set_probe_failing(true);
    h.orchestrator.initialize().await;

    let missing_id = h
        .orchestrator
        .execute(&request("get_customer_orders", json!({})))
        .await;
    assert!(!missing_id.is_success());
    assert_eq!(missing_id.error().unwrap().kind(), ErrorKind::InvalidArgument);

    let bad_limit = h
        .orchestrator
        .execute(&request("list_customers", json!({ "limit": 0 })))
        .await;
    assert_eq!(bad_limit.error().unwrap().kind(), ErrorKind::InvalidArgument);

    let unsupported = h
        .orchestrator
        .execute(&request("delete_customer", json!({ "customer_id": 1 })))
        .await;
    assert_eq!(unsupported.error().unwrap().kind(), ErrorKind::UnsupportedOperation);

    assert_eq!(h.store.queries(), 0);
    assert_eq!(h.primary.call_count(), 0);
    assert_eq!(h.orchestrator.mode().await, ExecutionMode::Fallback);
}

#[tokio::test]
async fn test_non_primary_tools_stay_on_their_server_in_fallback() {
    let dynamic = StubToolServer::shared("dynamic");
    let h = harness_with(test_config(), Some(dynamic.clone()));
    h.primary.set_probe_failing(true);
    h.orchestrator.initialize().await;
    assert_eq!(h.orchestrator.mode().await, ExecutionMode::Fallback);

    let result = h
        .orchestrator
        .execute(&request("text2sql", json!({ "question": "top customers" })))
        .await;
    assert!(result.is_success());
    assert_eq!(result.served_by(), ServedBy::Primary);
    assert_eq!(dynamic.call_count(), 1);
    assert_eq!(h.store.queries(), 0);
    assert_eq!(result.mode, ExecutionMode::Fallback);
}

#[tokio::test]
async fn test_batch_preserves_order() {
    let h = harness();
    h.orchestrator.initialize().await;

    let delays = [40u64, 30, 20, 10, 0];
    let requests = delays
        .iter()
        .map(|ms| request("echo", json!({ "delay_ms": ms })))
        .collect();
    let results = h.orchestrator.batch_execute(requests).await;

    assert_eq!(results.len(), delays.len());
    for (result, ms) in results.iter().zip(delays) {
        assert!(result.is_success());
        let payload = result.result.payload.as_ref().unwrap();
        assert_eq!(payload["arguments"]["delay_ms"], json!(ms));
    }

    let batch = h.orchestrator.status().await.batch;
    assert_eq!(batch.batches, 1);
    assert_eq!(batch.items, 5);
    assert!(batch.peak_in_flight <= 5);
}

#[tokio::test]
async fn test_single_recovery_trial_at_a_time() {
    let h = harness();
    h.primary.set_probe_failing(true);
    h.orchestrator.initialize().await;

    h.primary.set_probe_failing(false);
    h.orchestrator.monitor().check_server("primary").await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let slow = request("list_products", json!({ "delay_ms": 150 }));
    let other = products(7);
    let (a, b) = tokio::join!(h.orchestrator.execute(&slow), h.orchestrator.execute(&other));

    let served: Vec<ServedBy> = vec![a.served_by(), b.served_by()];
    assert_eq!(served.iter().filter(|s| **s == ServedBy::Primary).count(), 1);
    assert_eq!(served.iter().filter(|s| **s == ServedBy::Fallback).count(), 1);
    assert_eq!(h.primary.call_count(), 1);

    assert_eq!(h.orchestrator.mode().await, ExecutionMode::Primary);
    assert!(!h.orchestrator.status().await.recovery_trial_in_flight);
}

#[tokio::test]
async fn test_listener_follows_health_events() {
    let config = OrchestratorConfig {
        health_check_interval: Duration::from_millis(20),
        health_failure_threshold: 1,
        ..test_config()
    };
    let h = harness_with(config, None);
    h.orchestrator.initialize().await;
    h.orchestrator.start();

    h.primary.set_probe_failing(true);
    assert!(wait_for_mode(&h.orchestrator, ExecutionMode::Fallback).await);

    h.primary.set_probe_failing(false);
    assert!(wait_for_mode(&h.orchestrator, ExecutionMode::Recovery).await);

    let history = h.orchestrator.mode_history().await;
    assert_eq!(
        reasons(&history),
        vec!["primary server unhealthy", "primary healthy after recovery window"]
    );

    h.orchestrator.shutdown().await;
    assert!(!h.orchestrator.monitor().is_running());
}

#[tokio::test]
async fn test_status_snapshot_serializes() {
    let h = harness();
    h.primary.set_probe_failing(true);
    h.orchestrator.initialize().await;
    h.orchestrator.execute(&products(1)).await;

    let status = serde_json::to_value(h.orchestrator.status().await).unwrap();
    assert_eq!(status["mode"], json!("FALLBACK"));
    assert_eq!(status["history_len"], json!(1));
    assert_eq!(status["recent_transitions"][0]["reason"], json!("startup probe failed"));
    assert_eq!(status["mode_metrics"]["FALLBACK"]["executions"], json!(1));
    assert_eq!(status["servers"][0]["server_id"], json!("primary"));
    assert_eq!(status["servers"][0]["state"], json!("DEGRADED"));
    assert_eq!(status["fallback"]["successes"], json!(1));
    assert!(status["uptime_secs"].is_u64());

    let empty: Map<String, Value> = Map::new();
    assert!(h.orchestrator.fallback().validate(&ToolCallRequest::new("list_products", empty)).is_ok());
}
