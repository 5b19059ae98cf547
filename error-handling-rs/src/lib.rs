//! # Error Handling Framework
//!
//! Shared failure handling for the MCP orchestration layer:
//!
//! - A closed error taxonomy ([`ErrorKind`]) and the [`ToolError`] type every
//!   component returns
//! - Per-component circuit breakers with single-probe half-open gating
//! - The [`ErrorRecoveryManager`], mapping error kinds to recovery actions
//! - Structured logging bootstrap
//!

pub mod circuit_breaker;
pub mod logging;
pub mod recovery;
pub mod types;

// Re-export commonly used types
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot,
    CircuitState,
};
pub use logging::{init_logging, LoggingConfig};
pub use recovery::{
    classify_message, ComponentRecovery, ErrorRecord, ErrorRecoveryManager, RecoveryAction,
    RecoveryConfig, RecoveryPolicy, RecoveryStatistics,
};
pub use types::{ErrorKind, Result, ToolError};
