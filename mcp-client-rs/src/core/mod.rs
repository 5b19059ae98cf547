//! Core abstractions for calling tools on remote MCP servers
//!
//! A [`ToolServer`] is a named remote endpoint that can open
//! [`ToolConnection`]s; the client pools those connections and issues
//! [`ToolCallRequest`]s through them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use error_handling_rs::{Result, ToolError};

pub mod builder;

/// Structured tool arguments
pub type Arguments = Map<String, Value>;

/// A single tool invocation; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    tool_name: String,
    #[serde(default)]
    arguments: Arguments,
    #[serde(default = "Utc::now")]
    requested_at: DateTime<Utc>,
}

impl ToolCallRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            requested_at: Utc::now(),
        }
    }

    /// Build a request from a JSON object value
    ///
    /// Anything other than an object or null is rejected as an invalid
    /// `arguments` field.
    pub fn from_value(tool_name: impl Into<String>, arguments: Value) -> Result<Self> {
        match arguments {
            Value::Object(map) => Ok(Self::new(tool_name, map)),
            Value::Null => Ok(Self::new(tool_name, Map::new())),
            other => Err(ToolError::invalid_argument(
                "arguments",
                format!("expected an object, got {}", other),
            )),
        }
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }
}

/// Which execution path produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServedBy {
    Primary,
    Fallback,
    Cache,
}

/// Outcome of a tool invocation
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub success: bool,
    pub payload: Option<Value>,
    pub served_by: ServedBy,
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Duration,
    pub error: Option<ToolError>,
}

impl ToolCallResult {
    pub fn success(payload: Value, served_by: ServedBy, latency: Duration) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            served_by,
            latency,
            error: None,
        }
    }

    pub fn failure(error: ToolError, served_by: ServedBy, latency: Duration) -> Self {
        Self {
            success: false,
            payload: None,
            served_by,
            latency,
            error: Some(error),
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// One open connection to a tool server
#[async_trait]
pub trait ToolConnection: Send + Sync {
    /// Perform a single round-trip; timeouts are enforced by the caller
    async fn call(&self, tool_name: &str, arguments: &Arguments) -> Result<Value>;
}

/// A named remote tool server
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Stable identifier used for routing, pooling and breakers
    fn server_id(&self) -> &str;

    /// Open a new connection for the pool
    async fn open_connection(&self) -> Result<Box<dyn ToolConnection>>;

    /// Lightweight liveness check
    async fn probe(&self) -> Result<()>;

    /// Names of the tools the server announces
    async fn list_tools(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Re-establish credentials after an authentication failure
    async fn refresh_auth(&self) -> Result<()> {
        Ok(())
    }
}
