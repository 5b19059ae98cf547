//! # MCP Client
//!
//! Client side of the MCP orchestration layer.
//!
//! This crate provides:
//!
//! - `ToolServer` / `ToolConnection`: the seam between the client and a transport
//! - `ConnectionPool`: fixed-size per-server pools with bounded acquire waits
//! - `ResultCache`: TTL cache keyed by tool name and canonical arguments
//! - `RetryPolicy`: exponential backoff for transient failures
//! - `HttpToolServer`: the JSON-RPC over HTTP transport
//! - `EnhancedClient`: routing, pooling, caching and retries behind one call

pub mod core;
pub use core::{
    builder::EnhancedClientBuilder, Arguments, ServedBy, ToolCallRequest, ToolCallResult,
    ToolConnection, ToolServer,
};

pub mod cache;
pub use cache::{CacheKey, CacheStats, ResultCache};

pub mod retry;
pub use retry::{RetryPolicy, RetryState};

pub mod pool;
pub use pool::{ConnectionPool, ConnectionSlot, PoolConfig, PoolStats, PooledConnection};

pub mod http;
pub use http::HttpToolServer;

pub mod client;
pub use client::{ClientConfig, ClientStats, EnhancedClient, ToolMetrics};

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use error_handling_rs::{ErrorKind, Result, ToolError};
