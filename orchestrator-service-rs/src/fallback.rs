//! Local fallback path
//!
//! The [`FallbackHandler`] serves a fixed set of read operations straight
//! from a local data store. Operation names outside the registry and bad
//! arguments are rejected before the store is touched.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime};
use metrics::counter;
use rusqlite::ErrorCode;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use dynamic_sql::executor::{open_read_only, query_rows};
use error_handling_rs::{Result, ToolError};
use mcp_client::{Arguments, ServedBy, ToolCallRequest, ToolCallResult};

pub type Row = Map<String, Value>;

const SQLITE_DATETIME: &str = "%Y-%m-%d %H:%M:%S";
const MAX_LIMIT: i64 = 1000;
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// The registered fallback operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackOperation {
    ListCustomers,
    ListProducts,
    SearchCustomers,
    GetCustomerOrders,
    GetOrderDetails,
    GetCustomerValueByStatus,
    SalesByMonth,
}

impl FallbackOperation {
    pub const ALL: [FallbackOperation; 7] = [
        FallbackOperation::ListCustomers,
        FallbackOperation::ListProducts,
        FallbackOperation::SearchCustomers,
        FallbackOperation::GetCustomerOrders,
        FallbackOperation::GetOrderDetails,
        FallbackOperation::GetCustomerValueByStatus,
        FallbackOperation::SalesByMonth,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FallbackOperation::ListCustomers => "list_customers",
            FallbackOperation::ListProducts => "list_products",
            FallbackOperation::SearchCustomers => "search_customers",
            FallbackOperation::GetCustomerOrders => "get_customer_orders",
            FallbackOperation::GetOrderDetails => "get_order_details",
            FallbackOperation::GetCustomerValueByStatus => "get_customer_value_by_status",
            FallbackOperation::SalesByMonth => "sales_by_month",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Check `arguments` against the operation's schema.
    ///
    /// Integers may be JSON integers or decimal strings; unknown arguments
    /// are ignored.
    pub fn validate(self, arguments: &Arguments) -> Result<FallbackQuery> {
        let query = match self {
            FallbackOperation::ListCustomers => FallbackQuery::ListCustomers {
                limit: limit_arg(arguments, 50)?,
            },
            FallbackOperation::ListProducts => FallbackQuery::ListProducts,
            FallbackOperation::SearchCustomers => {
                let pattern = string_arg(arguments, "name_pattern")?.unwrap_or_else(|| "%".to_string());
                let name_pattern = if pattern.starts_with('%') {
                    pattern
                } else {
                    format!("%{}%", pattern)
                };
                FallbackQuery::SearchCustomers {
                    name_pattern,
                    limit: limit_arg(arguments, 10)?,
                }
            }
            FallbackOperation::GetCustomerOrders => FallbackQuery::GetCustomerOrders {
                customer_id: id_arg(arguments, "customer_id")?,
            },
            FallbackOperation::GetOrderDetails => FallbackQuery::GetOrderDetails {
                order_id: id_arg(arguments, "order_id")?,
            },
            FallbackOperation::GetCustomerValueByStatus => FallbackQuery::CustomerValueByStatus {
                customer_id: id_arg(arguments, "customer_id")?,
            },
            FallbackOperation::SalesByMonth => {
                let start = date_arg(arguments, "start_date", "2024-01-01T00:00:00Z", false)?;
                let end = date_arg(arguments, "end_date", "2024-12-31T23:59:59Z", true)?;
                if end < start {
                    return Err(ToolError::invalid_argument("end_date", "must not be before start_date"));
                }
                FallbackQuery::SalesByMonth { start, end }
            }
        };
        Ok(query)
    }
}

impl fmt::Display for FallbackOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A validated fallback read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackQuery {
    ListCustomers { limit: i64 },
    ListProducts,
    SearchCustomers { name_pattern: String, limit: i64 },
    GetCustomerOrders { customer_id: i64 },
    GetOrderDetails { order_id: i64 },
    CustomerValueByStatus { customer_id: i64 },
    /// Bounds in SQLite `YYYY-MM-DD HH:MM:SS` form
    SalesByMonth { start: String, end: String },
}

impl FallbackQuery {
    pub fn operation(&self) -> FallbackOperation {
        match self {
            FallbackQuery::ListCustomers { .. } => FallbackOperation::ListCustomers,
            FallbackQuery::ListProducts => FallbackOperation::ListProducts,
            FallbackQuery::SearchCustomers { .. } => FallbackOperation::SearchCustomers,
            FallbackQuery::GetCustomerOrders { .. } => FallbackOperation::GetCustomerOrders,
            FallbackQuery::GetOrderDetails { .. } => FallbackOperation::GetOrderDetails,
            FallbackQuery::CustomerValueByStatus { .. } => FallbackOperation::GetCustomerValueByStatus,
            FallbackQuery::SalesByMonth { .. } => FallbackOperation::SalesByMonth,
        }
    }

    /// Parameterised SQL and its bound values
    pub fn to_sql(&self) -> (&'static str, Vec<Value>) {
        match self {
            FallbackQuery::ListCustomers { limit } => (
                "SELECT id, name, email, created_at FROM customers ORDER BY id ASC LIMIT ?",
                vec![json!(limit)],
            ),
            FallbackQuery::ListProducts => (
                "SELECT id, sku, name, price_cents, stock FROM products ORDER BY id ASC",
                Vec::new(),
            ),
            FallbackQuery::SearchCustomers { name_pattern, limit } => (
                "SELECT id, name, email, created_at FROM customers \
                 WHERE lower(name) LIKE lower(?) ORDER BY created_at DESC LIMIT ?",
                vec![json!(name_pattern), json!(limit)],
            ),
            FallbackQuery::GetCustomerOrders { customer_id } => (
                "SELECT o.id AS order_id, o.status, o.created_at, p.name AS product, \
                 oi.quantity, oi.price_cents \
                 FROM orders o \
                 JOIN order_items oi ON oi.order_id = o.id \
                 JOIN products p ON p.id = oi.product_id \
                 WHERE o.customer_id = ? \
                 ORDER BY o.created_at DESC, o.id DESC",
                vec![json!(customer_id)],
            ),
            FallbackQuery::GetOrderDetails { order_id } => (
                "SELECT o.id AS order_id, o.status, o.created_at, c.name AS customer, c.email, \
                 p.sku, p.name AS product, oi.quantity, oi.price_cents \
                 FROM orders o \
                 JOIN customers c ON c.id = o.customer_id \
                 JOIN order_items oi ON oi.order_id = o.id \
                 JOIN products p ON p.id = oi.product_id \
                 WHERE o.id = ? \
                 ORDER BY oi.id ASC",
                vec![json!(order_id)],
            ),
            FallbackQuery::CustomerValueByStatus { customer_id } => (
                "SELECT o.status, SUM(oi.quantity * oi.price_cents) AS total_value_cents \
                 FROM orders o \
                 JOIN order_items oi ON oi.order_id = o.id \
                 WHERE o.customer_id = ? \
                 GROUP BY o.status \
                 ORDER BY o.status",
                vec![json!(customer_id)],
            ),
            FallbackQuery::SalesByMonth { start, end } => (
                "SELECT strftime('%Y-%m', o.created_at) AS ym, \
                 SUM(oi.quantity * oi.price_cents) AS total_cents \
                 FROM orders o \
                 JOIN order_items oi ON oi.order_id = o.id \
                 WHERE o.created_at BETWEEN ? AND ? \
                 GROUP BY ym \
                 ORDER BY ym",
                vec![json!(start), json!(end)],
            ),
        }
    }
}

fn string_arg(arguments: &Arguments, field: &str) -> Result<Option<String>> {
    match arguments.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ToolError::invalid_argument(field, "must be a string")),
    }
}

fn int_arg(arguments: &Arguments, field: &str) -> Result<Option<i64>> {
    match arguments.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| ToolError::invalid_argument(field, "must be an integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ToolError::invalid_argument(field, "must be an integer")),
        Some(_) => Err(ToolError::invalid_argument(field, "must be an integer")),
    }
}

fn limit_arg(arguments: &Arguments, default: i64) -> Result<i64> {
    let limit = int_arg(arguments, "limit")?.unwrap_or(default);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ToolError::invalid_argument(
            "limit",
            format!("must be between 1 and {}", MAX_LIMIT),
        ));
    }
    Ok(limit)
}

fn id_arg(arguments: &Arguments, field: &str) -> Result<i64> {
    match int_arg(arguments, field)? {
        Some(id) if id > 0 => Ok(id),
        Some(_) => Err(ToolError::invalid_argument(field, "must be a positive integer")),
        None => Err(ToolError::invalid_argument(field, "is required")),
    }
}

/// Accept `YYYY-MM-DD` or an ISO timestamp and render SQLite's format.
/// A bare date is the start of the day, or its end when `end_of_day`.
fn date_arg(arguments: &Arguments, field: &str, default: &str, end_of_day: bool) -> Result<String> {
    let raw = string_arg(arguments, field)?.unwrap_or_else(|| default.to_string());
    let cleaned = raw.trim().replace('T', " ");
    let cleaned = cleaned.trim_end_matches('Z');

    if let Ok(datetime) = NaiveDateTime::parse_from_str(cleaned, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(datetime.format(SQLITE_DATETIME).to_string());
    }
    if let Ok(datetime) = NaiveDateTime::parse_from_str(cleaned, "%Y-%m-%d %H:%M") {
        return Ok(datetime.format(SQLITE_DATETIME).to_string());
    }
    match NaiveDate::parse_from_str(cleaned, "%Y-%m-%d") {
        Ok(date) => {
            let time = if end_of_day { "23:59:59" } else { "00:00:00" };
            Ok(format!("{} {}", date.format("%Y-%m-%d"), time))
        }
        Err(_) => Err(ToolError::invalid_argument(
            field,
            format!("'{}' is not an ISO date", raw),
        )),
    }
}

/// Synchronous local reads keyed by the registry
#[cfg_attr(test, mockall::automock)]
pub trait DataStore: Send + Sync {
    fn query(&self, query: &FallbackQuery) -> Result<Vec<Row>>;
}

/// Read-only SQLite store over the customers/products/orders schema
#[derive(Debug, Clone)]
pub struct SqliteDataStore {
    path: PathBuf,
}

impl SqliteDataStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataStore for SqliteDataStore {
    fn query(&self, query: &FallbackQuery) -> Result<Vec<Row>> {
        let conn = open_read_only(&self.path).map_err(|e| {
            ToolError::connection_refused(format!(
                "fallback store {} unavailable: {}",
                self.path.display(),
                e
            ))
        })?;
        let (sql, params) = query.to_sql();
        query_rows(&conn, sql, &params, usize::MAX).map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) => {
                ToolError::connection_refused(format!("fallback store unavailable: {}", e))
            }
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                ToolError::resource_exhausted(format!("fallback store busy: {}", e))
            }
            _ => ToolError::unknown(format!("fallback query {} failed: {}", query.operation(), e)),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FallbackStats {
    pub executions: u64,
    pub successes: u64,
    pub rejected: u64,
    pub store_failures: u64,
}

pub struct FallbackHandler {
    store: Arc<dyn DataStore>,
    query_timeout: Duration,
    executions: AtomicU64,
    successes: AtomicU64,
    rejected: AtomicU64,
    store_failures: AtomicU64,
}

impl FallbackHandler {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            executions: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
        }
    }

    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self::new(Arc::new(SqliteDataStore::new(path)))
    }

    /// Bound every store read; expiry surfaces as a timeout
    pub fn with_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn supports(&self, tool_name: &str) -> bool {
        FallbackOperation::from_name(tool_name).is_some()
    }

    pub fn operations(&self) -> Vec<&'static str> {
        FallbackOperation::ALL.iter().map(|op| op.name()).collect()
    }

    /// Resolve and validate a request without touching the store
    pub fn validate(&self, request: &ToolCallRequest) -> Result<FallbackQuery> {
        let operation = FallbackOperation::from_name(request.tool_name()).ok_or_else(|| {
            ToolError::unsupported(format!(
                "'{}' is not a fallback operation",
                request.tool_name()
            ))
        })?;
        operation.validate(request.arguments())
    }

    /// Serve a request from the local store
    pub async fn execute(&self, request: &ToolCallRequest) -> Result<ToolCallResult> {
        let started = Instant::now();
        self.executions.fetch_add(1, Ordering::Relaxed);

        let query = match self.validate(request) {
            Ok(query) => query,
            Err(err) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(tool = request.tool_name(), error = %err, "Fallback request rejected");
                return Err(err);
            }
        };

        let store = Arc::clone(&self.store);
        let blocking_query = query.clone();
        let operation = query.operation();
        let read = tokio::task::spawn_blocking(move || store.query(&blocking_query));
        let rows = match tokio::time::timeout(self.query_timeout, read).await {
            Ok(joined) => joined
                .map_err(|e| ToolError::unknown(format!("fallback worker failed: {}", e)))
                .and_then(|rows| rows),
            Err(_) => Err(ToolError::timeout(format!(
                "fallback {} exceeded {}ms",
                operation,
                self.query_timeout.as_millis()
            ))),
        };

        match rows {
            Ok(rows) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                counter!("mcp_fallback_executions", 1, "operation" => operation.name(), "outcome" => "success");
                let payload = json!({
                    "status": "success",
                    "row_count": rows.len(),
                    "results": rows,
                    "fallback": true,
                });
                Ok(ToolCallResult::success(payload, ServedBy::Fallback, started.elapsed()))
            }
            Err(err) => {
                self.store_failures.fetch_add(1, Ordering::Relaxed);
                counter!("mcp_fallback_executions", 1, "operation" => operation.name(), "outcome" => "failure");
                warn!(operation = operation.name(), error = %err, "Fallback store failed");
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            executions: self.executions.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use error_handling_rs::ErrorKind;
    use rusqlite::Connection;

    fn request(tool: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest::from_value(tool, arguments).unwrap()
    }

    fn untouched_store() -> Arc<MockDataStore> {
        let mut store = MockDataStore::new();
        store.expect_query().never();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_unknown_operation_never_reaches_the_store() {
        let handler = FallbackHandler::new(untouched_store());
        let err = handler
            .execute(&request("drop_everything", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert!(!handler.supports("text2sql"));
        assert_eq!(handler.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_missing_and_invalid_arguments_never_reach_the_store() {
        let handler = FallbackHandler::new(untouched_store());

        let missing = handler
            .execute(&request("get_customer_orders", json!({})))
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::InvalidArgument);
        assert!(missing.to_string().contains("customer_id"));

        let cases = [
            ("get_order_details", json!({"order_id": 0})),
            ("get_customer_value_by_status", json!({"customer_id": "abc"})),
            ("search_customers", json!({"name_pattern": 7})),
            ("list_customers", json!({"limit": 5000})),
            ("sales_by_month", json!({"start_date": "last tuesday"})),
            ("sales_by_month", json!({"start_date": "2024-06-01", "end_date": "2024-01-01"})),
        ];
        for (tool, arguments) in cases {
            let err = handler.execute(&request(tool, arguments)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{}", tool);
        }
    }

    #[test]
    fn test_argument_normalisation() {
        let query = FallbackOperation::SearchCustomers
            .validate(request("search_customers", json!({"name_pattern": "ann", "limit": "3"})).arguments())
            .unwrap();
        assert_eq!(
            query,
            FallbackQuery::SearchCustomers {
                name_pattern: "%ann%".to_string(),
                limit: 3
            }
        );

        let query = FallbackOperation::SalesByMonth.validate(&Map::new()).unwrap();
        assert_eq!(
            query,
            FallbackQuery::SalesByMonth {
                start: "2024-01-01 00:00:00".to_string(),
                end: "2024-12-31 23:59:59".to_string()
            }
        );

        let query = FallbackOperation::SalesByMonth
            .validate(request("sales_by_month", json!({"start_date": "2024-03-01", "end_date": "2024-03-31", "extra": true})).arguments())
            .unwrap();
        assert_eq!(
            query,
            FallbackQuery::SalesByMonth {
                start: "2024-03-01 00:00:00".to_string(),
                end: "2024-03-31 23:59:59".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_successful_execution_is_tagged_fallback() {
        let mut store = MockDataStore::new();
        store
            .expect_query()
            .withf(|q| *q == FallbackQuery::GetCustomerOrders { customer_id: 2 })
            .times(1)
            .returning(|_| {
                let mut row = Row::new();
                row.insert("order_id".to_string(), json!(2));
                Ok(vec![row])
            });
        let handler = FallbackHandler::new(Arc::new(store));

        let result = handler
            .execute(&request("get_customer_orders", json!({"customer_id": "2"})))
            .await
            .unwrap();
        assert_eq!(result.served_by, ServedBy::Fallback);
        let payload = result.payload.unwrap();
        assert_eq!(payload["fallback"], true);
        assert_eq!(payload["row_count"], 1);
        assert_eq!(payload["results"][0]["order_id"], 2);
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced() {
        let mut store = MockDataStore::new();
        store
            .expect_query()
            .times(1)
            .returning(|_| Err(ToolError::connection_refused("disk gone")));
        let handler = FallbackHandler::new(Arc::new(store));

        let err = handler
            .execute(&request("list_products", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
        assert_eq!(handler.stats().store_failures, 1);
    }

    #[tokio::test]
    async fn test_slow_store_read_times_out() {
        let mut store = MockDataStore::new();
        store.expect_query().times(1).returning(|_| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Vec::new())
        });
        let handler = FallbackHandler::new(Arc::new(store)).with_timeout(Duration::from_millis(20));

        let err = handler
            .execute(&request("list_products", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("list_products"));
        assert_eq!(handler.stats().store_failures, 1);
    }

    fn seeded() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, email TEXT, created_at TEXT);
             CREATE TABLE products (id INTEGER PRIMARY KEY, sku TEXT, name TEXT, price_cents INTEGER, stock INTEGER);
             CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, status TEXT, created_at TEXT);
             CREATE TABLE order_items (id INTEGER PRIMARY KEY, order_id INTEGER, product_id INTEGER, quantity INTEGER, price_cents INTEGER);
             INSERT INTO customers VALUES (1, 'Anna', 'anna@example.com', '2024-01-05 09:00:00'),
                                          (2, 'Joanne', 'jo@example.com', '2024-02-05 09:00:00'),
                                          (3, 'Bob', 'bob@example.com', '2024-03-05 09:00:00');
             INSERT INTO products VALUES (1, 'SKU-1', 'Lamp', 2500, 10), (2, 'SKU-2', 'Desk', 12000, 3);
             INSERT INTO orders VALUES (1, 1, 'paid', '2024-03-10 10:00:00'),
                                       (2, 1, 'shipped', '2024-04-02 10:00:00'),
                                       (3, 2, 'paid', '2024-04-20 10:00:00');
             INSERT INTO order_items VALUES (1, 1, 1, 2, 2500), (2, 2, 2, 1, 12000), (3, 3, 1, 1, 2500);",
        )
        .unwrap();
        file
    }

    #[tokio::test]
    async fn test_sqlite_store_operations() {
        let db = seeded();
        let handler = FallbackHandler::sqlite(db.path());

        let found = handler
            .execute(&request("search_customers", json!({"name_pattern": "ANN"})))
            .await
            .unwrap()
            .payload
            .unwrap();
        assert_eq!(found["row_count"], 2);
        assert_eq!(found["results"][0]["name"], "Joanne");

        let value = handler
            .execute(&request("get_customer_value_by_status", json!({"customer_id": 1})))
            .await
            .unwrap()
            .payload
            .unwrap();
        assert_eq!(value["results"][0]["status"], "paid");
        assert_eq!(value["results"][0]["total_value_cents"], 5000);
        assert_eq!(value["results"][1]["total_value_cents"], 12000);

        let months = handler
            .execute(&request("sales_by_month", json!({"start_date": "2024-04-01T00:00:00Z"})))
            .await
            .unwrap()
            .payload
            .unwrap();
        assert_eq!(months["row_count"], 1);
        assert_eq!(months["results"][0]["ym"], "2024-04");
        assert_eq!(months["results"][0]["total_cents"], 14500);

        let details = handler
            .execute(&request("get_order_details", json!({"order_id": 2})))
            .await
            .unwrap()
            .payload
            .unwrap();
        assert_eq!(details["results"][0]["customer"], "Anna");
        assert_eq!(details["results"][0]["product"], "Desk");

        let products = handler
            .execute(&request("list_products", json!({})))
            .await
            .unwrap()
            .payload
            .unwrap();
        assert_eq!(products["results"][1]["sku"], "SKU-2");
    }

    #[tokio::test]
    async fn test_missing_database_is_connection_refused() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FallbackHandler::sqlite(dir.path().join("absent.db"));
        let err = handler
            .execute(&request("list_customers", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
    }
}
