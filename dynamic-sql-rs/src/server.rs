//! The dynamic SQL tool server
//!
//! Serves `text2sql` and `execute_generated_sql`. Tool-level problems such
//! as a missing preview or a rejected statement are reported inside the
//! payload under `error`; only unknown tools and malformed arguments fail
//! the call itself.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use error_handling_rs::{Result, ToolError};
use mcp_client::{Arguments, ToolConnection, ToolServer};

use crate::executor::{ExecutionError, Executor, SqliteExecutor};
use crate::manifest::{self, EXECUTE_GENERATED_SQL, TEXT2SQL};
use crate::planner::{CandidateStatement, HeuristicPlanner, PlannerError, QueryPlanner};
use crate::preview::{PreviewCache, DEFAULT_PREVIEW_TTL};
use crate::validation::{enforce_limit, validate_read_only};

const DEFAULT_MAX_RESULTS: usize = 100;

/// Server limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicSqlConfig {
    /// Hard cap on returned rows
    pub max_rows: usize,
    pub query_timeout: Duration,
    pub preview_ttl: Duration,
}

impl Default for DynamicSqlConfig {
    fn default() -> Self {
        Self {
            max_rows: 500,
            query_timeout: Duration::from_secs(8),
            preview_ttl: DEFAULT_PREVIEW_TTL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Preview,
    Execute,
}

struct Inner {
    planner: Arc<dyn QueryPlanner>,
    executor: Arc<dyn Executor>,
    previews: Arc<PreviewCache>,
    config: DynamicSqlConfig,
}

/// In-process tool server for generated read-only SQL
#[derive(Clone)]
pub struct DynamicSqlServer {
    server_id: String,
    inner: Arc<Inner>,
}

impl DynamicSqlServer {
    pub fn new(
        server_id: impl Into<String>,
        planner: Arc<dyn QueryPlanner>,
        executor: Arc<dyn Executor>,
        config: DynamicSqlConfig,
    ) -> Self {
        let previews = Arc::new(PreviewCache::new(config.preview_ttl));
        Self {
            server_id: server_id.into(),
            inner: Arc::new(Inner {
                planner,
                executor,
                previews,
                config,
            }),
        }
    }

    /// Heuristic planner over a SQLite file
    pub fn sqlite(server_id: impl Into<String>, db_path: impl AsRef<Path>, config: DynamicSqlConfig) -> Self {
        Self::new(
            server_id,
            Arc::new(HeuristicPlanner),
            Arc::new(SqliteExecutor::new(db_path)),
            config,
        )
    }

    pub fn previews(&self) -> &Arc<PreviewCache> {
        &self.inner.previews
    }

    pub fn config(&self) -> &DynamicSqlConfig {
        &self.inner.config
    }

    /// Dispatch one tool call
    pub async fn handle(&self, tool_name: &str, arguments: &Arguments) -> Result<Value> {
        self.inner.handle(tool_name, arguments).await
    }
}

impl Inner {
    async fn handle(&self, tool_name: &str, arguments: &Arguments) -> Result<Value> {
        match tool_name {
            TEXT2SQL => self.text2sql(arguments).await,
            EXECUTE_GENERATED_SQL => self.execute_generated_sql(arguments).await,
            other => Err(ToolError::unsupported(format!(
                "tool '{}' is not served by the dynamic SQL server",
                other
            ))),
        }
    }

    async fn text2sql(&self, arguments: &Arguments) -> Result<Value> {
        let question = string_arg(arguments, "natural_language_query")?
            .or(string_arg(arguments, "query")?)
            .unwrap_or_default();
        let schema = string_arg(arguments, "schema")?;
        let max_results = usize_arg(arguments, "max_results")?.unwrap_or(DEFAULT_MAX_RESULTS);

        let statement = match self.planner.plan(&question, schema.as_deref()).await {
            Ok(statement) if !statement.sql.trim().is_empty() => statement,
            Ok(_) | Err(PlannerError::NoSqlGenerated) => {
                return Ok(json!({"type": "error", "error": "no_sql_generated"}));
            }
            Err(e) => {
                warn!(error = %e, "Planner failed");
                return Ok(json!({"type": "error", "error": "no_sql_generated", "message": e.to_string()}));
            }
        };

        let preview_id = self.previews.insert(statement.clone(), question);
        debug!(preview_id = %preview_id, max_results, "Stored SQL preview");
        Ok(json!({
            "sql": statement.sql,
            "params": statement.params,
            "preview_id": preview_id,
        }))
    }

    async fn execute_generated_sql(&self, arguments: &Arguments) -> Result<Value> {
        let preview_id = string_arg(arguments, "preview_id")?;
        let mut sql = string_arg(arguments, "sql")?.filter(|s| !s.trim().is_empty());
        let mut params = match arguments.get("params") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => return Err(ToolError::invalid_argument("params", "must be an array")),
        };
        let max_results = usize_arg(arguments, "max_results")?.unwrap_or(DEFAULT_MAX_RESULTS);
        let mode = match string_arg(arguments, "mode")?.as_deref() {
            None | Some("execute") => Mode::Execute,
            Some("preview") => Mode::Preview,
            Some(other) => {
                return Err(ToolError::invalid_argument(
                    "mode",
                    format!("expected 'preview' or 'execute', got '{}'", other),
                ))
            }
        };

        if sql.is_none() {
            if let Some(id) = &preview_id {
                match self.previews.get(id) {
                    Some(entry) => {
                        sql = Some(entry.statement.sql);
                        params = entry.statement.params;
                    }
                    None => return Ok(json!({"error": "preview_not_found"})),
                }
            }
        }

        let Some(sql) = sql else {
            return Ok(json!({"error": "no_sql_provided"}));
        };

        let validated = match validate_read_only(&sql) {
            Ok(validated) => validated,
            Err(e) => {
                info!(reason = %e, "Rejected generated SQL");
                return Ok(json!({
                    "error": "validation_failed",
                    "message": "only single read-only SELECT/WITH statements are allowed",
                    "reason": e.to_string(),
                }));
            }
        };

        let row_cap = max_results.min(self.config.max_rows);
        let final_sql = enforce_limit(&validated, row_cap);

        if mode == Mode::Preview {
            return Ok(json!({"executed_sql": final_sql, "params": params}));
        }

        let statement = CandidateStatement::new(final_sql.clone(), params);
        match self
            .executor
            .execute(&statement, row_cap, self.config.query_timeout)
            .await
        {
            Ok(rows) => Ok(json!({
                "executed_sql": final_sql,
                "results": rows.rows,
                "row_count": rows.row_count,
                "timing_ms": rows.elapsed_ms,
            })),
            Err(ExecutionError::Timeout(limit)) => Ok(json!({
                "error": "timeout",
                "message": format!("Query exceeded {}s", limit.as_secs()),
            })),
            Err(e) => Ok(json!({"error": "execution_failed", "message": e.to_string()})),
        }
    }
}

fn string_arg(arguments: &Arguments, name: &str) -> Result<Option<String>> {
    match arguments.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ToolError::invalid_argument(name, "must be a string")),
    }
}

fn usize_arg(arguments: &Arguments, name: &str) -> Result<Option<usize>> {
    match arguments.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|v| Some(v as usize))
            .ok_or_else(|| ToolError::invalid_argument(name, "must be a non-negative integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ToolError::invalid_argument(name, "must be a non-negative integer")),
        Some(_) => Err(ToolError::invalid_argument(name, "must be a non-negative integer")),
    }
}

struct DynamicSqlConnection {
    inner: Arc<Inner>,
}

#[async_trait]
impl ToolConnection for DynamicSqlConnection {
    async fn call(&self, tool_name: &str, arguments: &Arguments) -> Result<Value> {
        self.inner.handle(tool_name, arguments).await
    }
}

#[async_trait]
impl ToolServer for DynamicSqlServer {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn open_connection(&self) -> Result<Box<dyn ToolConnection>> {
        Ok(Box::new(DynamicSqlConnection {
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn probe(&self) -> Result<()> {
        self.inner
            .executor
            .ping()
            .await
            .map_err(|e| ToolError::connection_refused(format!("dynamic SQL store unavailable: {}", e)))
    }

    async fn list_tools(&self) -> Result<Vec<String>> {
        Ok(mcp_client::http::parse_toolset(&manifest::toolset()))
    }
}
