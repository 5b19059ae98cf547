//! The enhanced MCP client: routing, pooling, caching and retries

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use error_handling_rs::{ErrorKind, Result, ToolError};

use crate::cache::{CacheKey, CacheStats, ResultCache};
use crate::core::builder::EnhancedClientBuilder;
use crate::core::{ServedBy, ToolCallRequest, ToolCallResult, ToolServer};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::retry::RetryPolicy;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    /// Lifetime of cached results; zero disables the cache
    pub cache_ttl: Duration,
    /// Upper bound for one remote round-trip
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            cache_ttl: Duration::from_secs(300),
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-tool execution metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolMetrics {
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub total_duration_ms: f64,
    pub last_error: Option<String>,
    pub last_execution: Option<DateTime<Utc>>,
}

impl ToolMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.execution_count as f64
        }
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.execution_count == 0 {
            0.0
        } else {
            self.total_duration_ms / self.execution_count as f64
        }
    }
}

/// Snapshot of the client for status export
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub pools: Vec<PoolStats>,
    pub cache: CacheStats,
    pub tools: HashMap<String, ToolMetrics>,
    pub routes: HashMap<String, String>,
}

pub struct EnhancedClient {
    pool: ConnectionPool,
    cache: Arc<ResultCache>,
    retry: RetryPolicy,
    call_timeout: Duration,
    routes: RwLock<HashMap<String, String>>,
    default_server: RwLock<Option<String>>,
    metrics: Mutex<HashMap<String, ToolMetrics>>,
}

impl EnhancedClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            pool: ConnectionPool::new(config.pool),
            cache: Arc::new(ResultCache::new(config.cache_ttl)),
            retry: config.retry,
            call_timeout: config.call_timeout,
            routes: RwLock::new(HashMap::new()),
            default_server: RwLock::new(None),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn builder() -> EnhancedClientBuilder {
        EnhancedClientBuilder::new()
    }

    /// Register a server; the first one becomes the default route
    pub fn register_server(&self, server: Arc<dyn ToolServer>) {
        let server_id = server.server_id().to_string();
        self.pool.register(server);
        let mut default = self
            .default_server
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if default.is_none() {
            *default = Some(server_id);
        }
    }

    /// Route `tool_name` to `server_id`
    pub fn route(&self, tool_name: impl Into<String>, server_id: impl Into<String>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tool_name.into(), server_id.into());
    }

    /// The server a tool is routed to
    pub fn server_for(&self, tool_name: &str) -> Option<String> {
        if let Some(server_id) = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool_name)
        {
            return Some(server_id.clone());
        }
        self.default_server
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn server(&self, server_id: &str) -> Option<Arc<dyn ToolServer>> {
        self.pool.server(server_id)
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.pool.server_ids()
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Ask every server for its toolset and route the announced tools.
    ///
    /// Servers that cannot be reached are skipped; returns the number of
    /// routes learned.
    pub async fn discover_routes(&self) -> usize {
        let mut learned = 0;
        for server_id in self.pool.server_ids() {
            let Some(server) = self.pool.server(&server_id) else {
                continue;
            };
            match server.list_tools().await {
                Ok(tools) => {
                    for tool in tools {
                        self.route(tool, server_id.clone());
                        learned += 1;
                    }
                }
                Err(e) => warn!(server_id = %server_id, error = %e, "Tool discovery failed"),
            }
        }
        info!(learned, "Tool routes discovered");
        learned
    }

    /// Call a tool on the server it is routed to
    pub async fn call(&self, request: &ToolCallRequest) -> Result<ToolCallResult> {
        let server_id = self.server_for(request.tool_name()).ok_or_else(|| {
            ToolError::unsupported(format!("no tool server for '{}'", request.tool_name()))
        })?;
        self.call_on(&server_id, request).await
    }

    /// A live cached result for `request`, without touching any server
    pub fn cached(&self, request: &ToolCallRequest) -> Option<ToolCallResult> {
        let started = Instant::now();
        let tool_name = request.tool_name();
        let payload = self.cache.get(&CacheKey::new(tool_name, request.arguments()))?;
        debug!(tool = tool_name, "Serving tool result from cache");
        self.update_metrics(tool_name, |m| {
            m.execution_count += 1;
            m.success_count += 1;
            m.cache_hits += 1;
        });
        Some(ToolCallResult::success(payload, ServedBy::Cache, started.elapsed()))
    }

    /// Call a tool on a specific server.
    ///
    /// A live cache entry is returned without touching the server. Transient
    /// failures are retried with exponential backoff; an authentication
    /// failure triggers one credential refresh and one retry.
    pub async fn call_on(&self, server_id: &str, request: &ToolCallRequest) -> Result<ToolCallResult> {
        if let Some(result) = self.cached(request) {
            return Ok(result);
        }

        let started = Instant::now();
        let tool_name = request.tool_name();
        let key = CacheKey::new(tool_name, request.arguments());

        let mut retry = self.retry.state();
        loop {
            match self.attempt(server_id, request).await {
                Ok(payload) => {
                    self.cache.insert(key, payload.clone());
                    let elapsed = started.elapsed();
                    histogram!("mcp_call_duration_ms", elapsed.as_secs_f64() * 1000.0, "tool" => tool_name.to_string());
                    self.update_metrics(tool_name, |m| {
                        m.execution_count += 1;
                        m.success_count += 1;
                        m.retries += u64::from(retry.retries());
                        m.total_duration_ms += elapsed.as_secs_f64() * 1000.0;
                    });
                    return Ok(ToolCallResult::success(payload, ServedBy::Primary, elapsed));
                }
                Err(err) => {
                    if err.kind() == ErrorKind::AuthenticationFailure && retry.take_auth_retry() {
                        warn!(server_id, tool = tool_name, "Authentication failed, refreshing credentials");
                        if let Err(refresh_err) = self.refresh_auth(server_id).await {
                            self.record_failure(tool_name, &refresh_err, started, retry.retries());
                            return Err(refresh_err);
                        }
                        continue;
                    }

                    if err.is_transient() {
                        if let Some(delay) = retry.next_delay() {
                            warn!(
                                server_id,
                                tool = tool_name,
                                attempt = retry.retries(),
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "Transient failure, retrying"
                            );
                            counter!("mcp_call_retries", 1, "tool" => tool_name.to_string());
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }

                    self.record_failure(tool_name, &err, started, retry.retries());
                    return Err(err);
                }
            }
        }
    }

    /// One acquire-call-release round
    async fn attempt(&self, server_id: &str, request: &ToolCallRequest) -> Result<Value> {
        let connection = self.pool.acquire(server_id).await?;
        let outcome = match tokio::time::timeout(
            self.call_timeout,
            connection.call(request.tool_name(), request.arguments()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(ToolError::timeout(format!(
                "{} on {} exceeded {}ms",
                request.tool_name(),
                server_id,
                self.call_timeout.as_millis()
            ))),
        };
        self.pool.release(connection);
        outcome
    }

    /// Probe one server
    pub async fn probe(&self, server_id: &str) -> Result<()> {
        match self.pool.server(server_id) {
            Some(server) => server.probe().await,
            None => Err(ToolError::unsupported(format!(
                "no tool server registered as '{}'",
                server_id
            ))),
        }
    }

    /// Drop every cached result
    pub fn clear_cache(&self) -> usize {
        let cleared = self.cache.clear();
        info!(cleared, "Result cache cleared");
        cleared
    }

    /// Discard pooled connections for a server
    pub fn restart_connections(&self, server_id: &str) -> bool {
        self.pool.restart(server_id)
    }

    pub async fn refresh_auth(&self, server_id: &str) -> Result<()> {
        match self.pool.server(server_id) {
            Some(server) => {
                server.refresh_auth().await?;
                // Connections may carry the old credentials.
                self.pool.restart(server_id);
                Ok(())
            }
            None => Err(ToolError::unsupported(format!(
                "no tool server registered as '{}'",
                server_id
            ))),
        }
    }

    pub fn tool_metrics(&self, tool_name: &str) -> Option<ToolMetrics> {
        self.lock_metrics().get(tool_name).cloned()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            pools: self.pool.stats(),
            cache: self.cache.stats(),
            tools: self.lock_metrics().clone(),
            routes: self
                .routes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn record_failure(&self, tool_name: &str, err: &ToolError, started: Instant, retries: u32) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        counter!("mcp_call_failures", 1, "tool" => tool_name.to_string(), "kind" => err.kind().as_str());
        self.update_metrics(tool_name, |m| {
            m.execution_count += 1;
            m.failure_count += 1;
            m.retries += u64::from(retries);
            m.total_duration_ms += elapsed_ms;
            m.last_error = Some(err.to_string());
        });
    }

    fn update_metrics<F: FnOnce(&mut ToolMetrics)>(&self, tool_name: &str, update: F) {
        let mut metrics = self.lock_metrics();
        let entry = metrics.entry(tool_name.to_string()).or_default();
        update(entry);
        entry.last_execution = Some(Utc::now());
    }

    fn lock_metrics(&self) -> MutexGuard<'_, HashMap<String, ToolMetrics>> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
