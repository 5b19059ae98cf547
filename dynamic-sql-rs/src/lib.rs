//! # Dynamic SQL
//!
//! A tool server that turns questions into read-only SQL and runs it
//! against a read-only database.
//!
//! - `QueryPlanner`: question → candidate statement (`HeuristicPlanner` built in)
//! - `validation`: single-statement, read-only checks and row-limit wrapping
//! - `Executor`: runs validated statements (`SqliteExecutor` built in)
//! - `PreviewCache`: short-lived store of generated statements
//! - `DynamicSqlServer`: the `text2sql` and `execute_generated_sql` tools

pub mod executor;
pub use executor::{ExecutionError, Executor, QueryRows, SqliteExecutor};

pub mod manifest;
pub use manifest::{toolset, ToolDefinition, EXECUTE_GENERATED_SQL, TEXT2SQL};

pub mod planner;
pub use planner::{CandidateStatement, HeuristicPlanner, PlannerError, QueryPlanner, DEFAULT_SCHEMA};

pub mod preview;
pub use preview::{PreviewCache, PreviewEntry};

pub mod server;
pub use server::{DynamicSqlConfig, DynamicSqlServer};

pub mod validation;
pub use validation::{enforce_limit, is_read_only, validate_read_only, SqlValidationError};
