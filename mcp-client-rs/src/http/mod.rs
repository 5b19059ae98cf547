//! HTTP JSON-RPC transport for MCP tool servers
//!
//! Calls are `POST {base}/mcp` with a `tools/call` JSON-RPC body; liveness
//! and tool discovery use `GET {base}/api/toolset`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::debug;

use error_handling_rs::{Result, ToolError};

use crate::core::{Arguments, ToolConnection, ToolServer};

pub mod mapping;

pub use mapping::{extract_error_message, map_rpc_error, parse_rpc_response, parse_toolset};

const API_KEY_HEADER: &str = "x-api-key";

/// A tool server reachable over HTTP
pub struct HttpToolServer {
    server_id: String,
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
    probe_client: reqwest::Client,
    request_ids: Arc<AtomicU64>,
}

impl HttpToolServer {
    pub fn new(server_id: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        Self::with_options(server_id, base_url, None, Duration::from_secs(30))
    }

    /// Build a server with an optional API key and a per-request timeout
    pub fn with_options(
        server_id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let probe_client = build_client(api_key.as_deref(), request_timeout)?;
        Ok(Self {
            server_id: server_id.into(),
            base_url,
            api_key,
            request_timeout,
            probe_client,
            request_ids: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_toolset(&self) -> Result<Value> {
        let url = format!("{}/api/toolset", self.base_url);
        let response = self.probe_client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::from_http_status(
                status.as_u16(),
                extract_error_message(&body),
            ));
        }
        Ok(response.json::<Value>().await?)
    }
}

fn build_client(api_key: Option<&str>, timeout: Duration) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(key) = api_key {
        let value = HeaderValue::from_str(key)
            .map_err(|_| ToolError::authentication("API key is not a valid header value"))?;
        headers.insert(API_KEY_HEADER, value);
    }

    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()?)
}

#[async_trait]
impl ToolServer for HttpToolServer {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn open_connection(&self) -> Result<Box<dyn ToolConnection>> {
        let client = build_client(self.api_key.as_deref(), self.request_timeout)?;
        Ok(Box::new(HttpConnection {
            client,
            endpoint: format!("{}/mcp", self.base_url),
            request_ids: Arc::clone(&self.request_ids),
        }))
    }

    async fn probe(&self) -> Result<()> {
        self.fetch_toolset().await.map(|_| ())
    }

    async fn list_tools(&self) -> Result<Vec<String>> {
        Ok(parse_toolset(&self.fetch_toolset().await?))
    }
}

/// One pooled HTTP client bound to a server's `/mcp` endpoint
struct HttpConnection {
    client: reqwest::Client,
    endpoint: String,
    request_ids: Arc<AtomicU64>,
}

#[async_trait]
impl ToolConnection for HttpConnection {
    async fn call(&self, tool_name: &str, arguments: &Arguments) -> Result<Value> {
        let id = self.request_ids.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": tool_name, "arguments": arguments},
        });

        debug!(endpoint = %self.endpoint, tool = tool_name, id, "Sending tools/call");
        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::from_http_status(
                status.as_u16(),
                extract_error_message(&body),
            ));
        }

        let envelope: Value = response.json().await?;
        parse_rpc_response(envelope)
    }
}
