//! Orchestrator configuration
//!
//! Every option is gathered once into [`OrchestratorConfig`] and handed to the
//! components by value. Nothing below the entry point reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use dynamic_sql::DynamicSqlConfig;
use error_handling_rs::{CircuitBreakerConfig, RecoveryConfig, RecoveryPolicy};
use mcp_client::{ClientConfig, PoolConfig, RetryPolicy};

use crate::health::HealthConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("retry max delay must not be shorter than the base delay")]
    RetryDelays,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub primary_server_id: String,
    pub primary_url: String,
    pub api_key: Option<String>,
    pub dynamic_server_id: String,

    pub pool_size: usize,
    pub pool_acquire_timeout: Duration,
    pub call_timeout: Duration,
    pub cache_ttl: Duration,

    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    pub health_check_interval: Duration,
    pub health_failure_threshold: u32,
    pub batch_concurrency: usize,

    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,

    /// Minimum time in FALLBACK or DEGRADED before a recovery trial
    pub recovery_window: Duration,
    /// PRIMARY moves to FALLBACK once consecutive primary errors exceed this
    pub consecutive_error_threshold: u32,
    pub mode_history_cap: usize,
    pub error_history_cap: usize,

    pub last_known_good_cap: usize,
    pub last_known_good_max_age: Duration,

    pub fallback_db_path: PathBuf,
    /// Upper bound for one fallback store read
    pub fallback_timeout: Duration,
    pub dynamic_max_rows: usize,
    pub dynamic_query_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            primary_server_id: "primary".to_string(),
            primary_url: "http://localhost:5000".to_string(),
            api_key: None,
            dynamic_server_id: "dynamic".to_string(),
            pool_size: 10,
            pool_acquire_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(300),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            health_failure_threshold: 3,
            batch_concurrency: 5,
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            recovery_window: Duration::from_secs(300),
            consecutive_error_threshold: 3,
            mode_history_cap: 100,
            error_history_cap: 1000,
            last_known_good_cap: 256,
            last_known_good_max_age: Duration::from_secs(3600),
            fallback_db_path: PathBuf::from("db/app.db"),
            fallback_timeout: Duration::from_secs(10),
            dynamic_max_rows: 500,
            dynamic_query_timeout: Duration::from_secs(8),
        }
    }
}

impl OrchestratorConfig {
    /// Read `MCP_*` variables, keeping the default for anything unset
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            primary_server_id: config_rs::get_env_string("MCP_PRIMARY_SERVER_ID", &d.primary_server_id),
            primary_url: config_rs::get_env_optional("MCP_TOOLBOX_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| config_rs::get_server_url("PRIMARY", 5000, None)),
            api_key: config_rs::get_env_optional("MCP_API_KEY"),
            dynamic_server_id: config_rs::get_env_string("MCP_DYNAMIC_SERVER_ID", &d.dynamic_server_id),
            pool_size: config_rs::get_env_usize("MCP_POOL_SIZE", d.pool_size),
            pool_acquire_timeout: config_rs::get_env_duration_ms(
                "MCP_POOL_ACQUIRE_TIMEOUT_MS",
                d.pool_acquire_timeout,
            ),
            call_timeout: config_rs::get_env_duration_secs("MCP_CALL_TIMEOUT_SECS", d.call_timeout),
            cache_ttl: config_rs::get_env_duration_secs("MCP_CACHE_TTL_SECS", d.cache_ttl),
            max_retries: config_rs::get_env_u32("MCP_MAX_RETRIES", d.max_retries),
            retry_base_delay: config_rs::get_env_duration_ms("MCP_RETRY_BASE_DELAY_MS", d.retry_base_delay),
            retry_max_delay: config_rs::get_env_duration_ms("MCP_RETRY_MAX_DELAY_MS", d.retry_max_delay),
            health_check_interval: config_rs::get_env_duration_secs(
                "MCP_HEALTH_CHECK_INTERVAL_SECS",
                d.health_check_interval,
            ),
            health_failure_threshold: config_rs::get_env_u32(
                "MCP_HEALTH_FAILURE_THRESHOLD",
                d.health_failure_threshold,
            ),
            batch_concurrency: config_rs::get_env_usize("MCP_BATCH_CONCURRENCY", d.batch_concurrency),
            breaker_failure_threshold: config_rs::get_env_u32(
                "MCP_BREAKER_FAILURE_THRESHOLD",
                d.breaker_failure_threshold,
            ),
            breaker_cooldown: config_rs::get_env_duration_secs("MCP_BREAKER_COOLDOWN_SECS", d.breaker_cooldown),
            recovery_window: config_rs::get_env_duration_secs("MCP_RECOVERY_WINDOW_SECS", d.recovery_window),
            consecutive_error_threshold: config_rs::get_env_u32(
                "MCP_CONSECUTIVE_ERROR_THRESHOLD",
                d.consecutive_error_threshold,
            ),
            mode_history_cap: config_rs::get_env_usize("MCP_MODE_HISTORY_CAP", d.mode_history_cap),
            error_history_cap: config_rs::get_env_usize("MCP_ERROR_HISTORY_CAP", d.error_history_cap),
            last_known_good_cap: config_rs::get_env_usize("MCP_LAST_KNOWN_GOOD_CAP", d.last_known_good_cap),
            last_known_good_max_age: config_rs::get_env_duration_secs(
                "MCP_LAST_KNOWN_GOOD_MAX_AGE_SECS",
                d.last_known_good_max_age,
            ),
            fallback_db_path: config_rs::get_env_optional("MCP_FALLBACK_DB_PATH")
                .or_else(|| config_rs::get_env_optional("DATABASE_PATH"))
                .map(PathBuf::from)
                .unwrap_or(d.fallback_db_path),
            fallback_timeout: config_rs::get_env_duration_secs("MCP_FALLBACK_TIMEOUT_SECS", d.fallback_timeout),
            dynamic_max_rows: config_rs::get_env_usize("MCP_DYNAMIC_MAX_ROWS", d.dynamic_max_rows),
            dynamic_query_timeout: config_rs::get_env_duration_secs(
                "MCP_DYNAMIC_QUERY_TIMEOUT_SECS",
                d.dynamic_query_timeout,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("pool_size", self.pool_size),
            ("batch_concurrency", self.batch_concurrency),
            ("mode_history_cap", self.mode_history_cap),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        let thresholds = [
            ("health_failure_threshold", self.health_failure_threshold),
            ("breaker_failure_threshold", self.breaker_failure_threshold),
        ];
        for (field, value) in thresholds {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        if self.fallback_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "fallback_timeout",
            });
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(ConfigError::RetryDelays);
        }
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            pool: PoolConfig {
                max_connections: self.pool_size,
                acquire_timeout: self.pool_acquire_timeout,
            },
            cache_ttl: self.cache_ttl,
            call_timeout: self.call_timeout,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                initial_interval: self.retry_base_delay,
                max_interval: self.retry_max_delay,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            breaker: CircuitBreakerConfig {
                failure_threshold: self.breaker_failure_threshold,
                cooldown: self.breaker_cooldown,
                ..CircuitBreakerConfig::default()
            },
            history_cap: self.error_history_cap,
            policy: RecoveryPolicy::default(),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            check_interval: self.health_check_interval,
            failure_threshold: self.health_failure_threshold,
            batch_concurrency: self.batch_concurrency,
            ..HealthConfig::default()
        }
    }

    pub fn dynamic_sql_config(&self) -> DynamicSqlConfig {
        DynamicSqlConfig {
            max_rows: self.dynamic_max_rows,
            query_timeout: self.dynamic_query_timeout,
            ..DynamicSqlConfig::default()
        }
    }
}
