//! Client builder implementation
//!
//! Collects pool, cache, retry and routing settings and produces a ready
//! [`EnhancedClient`].

use std::sync::Arc;
use std::time::Duration;

use crate::client::{ClientConfig, EnhancedClient};
use crate::core::ToolServer;
use crate::retry::RetryPolicy;

/// Builder for [`EnhancedClient`]
#[derive(Default)]
pub struct EnhancedClientBuilder {
    config: ClientConfig,

    /// Servers registered in order; the first is the default route
    servers: Vec<Arc<dyn ToolServer>>,

    /// Explicit tool → server routes
    routes: Vec<(String, String)>,
}

impl EnhancedClientBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum connections per server
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool.max_connections = size;
        self
    }

    /// Set how long a call waits for a free connection
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.acquire_timeout = timeout;
        self
    }

    /// Set the result cache TTL
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Set the per-attempt call timeout
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Configure retry behavior
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Register a tool server
    pub fn server(mut self, server: Arc<dyn ToolServer>) -> Self {
        self.servers.push(server);
        self
    }

    /// Route a tool to a server id
    pub fn route(mut self, tool_name: impl Into<String>, server_id: impl Into<String>) -> Self {
        self.routes.push((tool_name.into(), server_id.into()));
        self
    }

    pub fn build(self) -> EnhancedClient {
        let client = EnhancedClient::new(self.config);
        for server in self.servers {
            client.register_server(server);
        }
        for (tool_name, server_id) in self.routes {
            client.route(tool_name, server_id);
        }
        client
    }
}
