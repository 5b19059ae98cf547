//! Fixed-size connection pools, one per registered tool server
//!
//! Capacity is enforced with a semaphore: a caller holds a permit for as
//! long as it holds a [`PooledConnection`], and the slot goes back to the
//! idle set when the guard is dropped, whatever the outcome of the call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use error_handling_rs::{Result, ToolError};

use crate::core::{Arguments, ToolConnection, ToolServer};

/// Configuration for the connection pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum open connections per server
    pub max_connections: usize,
    /// How long `acquire` waits for a free slot
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// One pooled connection
pub struct ConnectionSlot {
    id: u64,
    handle: Box<dyn ToolConnection>,
    in_use: bool,
    created_at: Instant,
    last_used_at: Instant,
    generation: u64,
}

impl ConnectionSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }
}

/// Pool statistics for one server
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub server_id: String,
    pub max_connections: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub exhausted: u64,
}

struct ServerPool {
    server: Arc<dyn ToolServer>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<ConnectionSlot>>,
    generation: AtomicU64,
    next_slot_id: AtomicU64,
    in_use: AtomicUsize,
    created: AtomicU64,
    exhausted: AtomicU64,
}

impl ServerPool {
    fn take_idle(&self) -> Option<ConnectionSlot> {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(slot) = idle.pop() {
            if slot.generation == generation {
                return Some(slot);
            }
        }
        None
    }

    fn give_back(&self, mut slot: ConnectionSlot) {
        slot.in_use = false;
        slot.last_used_at = Instant::now();
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        if slot.generation == self.generation.load(Ordering::SeqCst) {
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(slot);
        } else {
            debug!(server_id = %self.server.server_id(), slot = slot.id, "Discarding stale connection");
        }
    }
}

/// A checked-out slot; returned to the pool on drop
pub struct PooledConnection {
    slot: Option<ConnectionSlot>,
    pool: Arc<ServerPool>,
    // Freed after `drop` has put the slot back in the idle set.
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("server_id", &self.server_id())
            .field("slot_id", &self.slot.as_ref().map(|s| s.id))
            .finish()
    }
}

impl PooledConnection {
    pub fn slot(&self) -> Option<&ConnectionSlot> {
        self.slot.as_ref()
    }

    pub fn server_id(&self) -> &str {
        self.pool.server.server_id()
    }

    pub async fn call(&self, tool_name: &str, arguments: &Arguments) -> Result<Value> {
        match &self.slot {
            Some(slot) => slot.handle.call(tool_name, arguments).await,
            None => Err(ToolError::unknown("connection already released")),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.give_back(slot);
        }
    }
}

/// Connection pools keyed by server id
pub struct ConnectionPool {
    config: PoolConfig,
    servers: RwLock<HashMap<String, Arc<ServerPool>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register a server; re-registering an id replaces its pool
    pub fn register(&self, server: Arc<dyn ToolServer>) {
        let server_id = server.server_id().to_string();
        let pool = Arc::new(ServerPool {
            server,
            permits: Arc::new(Semaphore::new(self.config.max_connections.max(1))),
            idle: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            next_slot_id: AtomicU64::new(1),
            in_use: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        });
        info!(server_id = %server_id, size = self.config.max_connections, "Registered connection pool");
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_id, pool);
    }

    pub fn server(&self, server_id: &str) -> Option<Arc<dyn ToolServer>> {
        self.lookup(server_id).ok().map(|pool| Arc::clone(&pool.server))
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Check out a slot, opening a new connection while below capacity.
    ///
    /// Waits at most `acquire_timeout` for a slot and fails with
    /// [`ToolError::PoolExhausted`] afterwards.
    pub async fn acquire(&self, server_id: &str) -> Result<PooledConnection> {
        let pool = self.lookup(server_id)?;
        let started = Instant::now();

        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&pool.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ToolError::connection_refused(format!(
                    "connection pool for {} is closed",
                    server_id
                )))
            }
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                pool.exhausted.fetch_add(1, Ordering::Relaxed);
                counter!("mcp_pool_exhausted", 1, "server" => server_id.to_string());
                warn!(server_id, waited_ms, "Connection pool exhausted");
                return Err(ToolError::pool_exhausted(server_id, waited_ms));
            }
        };

        let mut slot = match pool.take_idle() {
            Some(slot) => slot,
            None => {
                // The permit is released by drop if opening fails.
                let handle = pool.server.open_connection().await?;
                let now = Instant::now();
                let id = pool.next_slot_id.fetch_add(1, Ordering::SeqCst);
                pool.created.fetch_add(1, Ordering::Relaxed);
                debug!(server_id, slot = id, "Opened pooled connection");
                ConnectionSlot {
                    id,
                    handle,
                    in_use: false,
                    created_at: now,
                    last_used_at: now,
                    generation: pool.generation.load(Ordering::SeqCst),
                }
            }
        };

        slot.in_use = true;
        slot.last_used_at = Instant::now();
        pool.in_use.fetch_add(1, Ordering::SeqCst);

        Ok(PooledConnection {
            slot: Some(slot),
            pool,
            _permit: permit,
        })
    }

    /// Return a slot to its pool
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Drop idle connections and mark checked-out ones stale
    pub fn restart(&self, server_id: &str) -> bool {
        match self.lookup(server_id) {
            Ok(pool) => {
                pool.generation.fetch_add(1, Ordering::SeqCst);
                let dropped = {
                    let mut idle = pool.idle.lock().unwrap_or_else(PoisonError::into_inner);
                    let count = idle.len();
                    idle.clear();
                    count
                };
                info!(server_id, dropped, "Restarted connection pool");
                true
            }
            Err(_) => false,
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<PoolStats> = servers
            .iter()
            .map(|(server_id, pool)| PoolStats {
                server_id: server_id.clone(),
                max_connections: self.config.max_connections,
                idle: pool.idle.lock().unwrap_or_else(PoisonError::into_inner).len(),
                in_use: pool.in_use.load(Ordering::SeqCst),
                created: pool.created.load(Ordering::Relaxed),
                exhausted: pool.exhausted.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        stats
    }

    fn lookup(&self, server_id: &str) -> Result<Arc<ServerPool>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .cloned()
            .ok_or_else(|| {
                ToolError::unsupported(format!("no tool server registered as '{}'", server_id))
            })
    }
}
