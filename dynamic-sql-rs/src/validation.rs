//! Read-only SQL validation
//!
//! Generated statements are only executed when they are a single `SELECT`
//! or `WITH` statement free of write or schema keywords. Statements without
//! an explicit `LIMIT` are wrapped so the server row cap always applies.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Keywords that disqualify a statement, matched on word boundaries
pub const FORBIDDEN_KEYWORDS: [&str; 9] = [
    "insert", "update", "delete", "drop", "alter", "create", "truncate", "attach", "pragma",
];

static FORBIDDEN_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(&format!(r"\b({})\b", FORBIDDEN_KEYWORDS.join("|"))).ok()
});

static TRAILING_SEMICOLONS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r";+\s*$").ok());

/// SQL validation error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SqlValidationError {
    #[error("Statement is empty")]
    Empty,

    #[error("Multiple statements are not allowed")]
    MultipleStatements,

    #[error("Statement must start with SELECT or WITH")]
    NotReadOnly,

    #[error("Statement contains a forbidden keyword: '{0}'")]
    ForbiddenKeyword(String),
}

/// Strip trailing semicolons and surrounding whitespace
pub fn normalize(sql: &str) -> String {
    let trimmed = sql.trim();
    match &*TRAILING_SEMICOLONS {
        Some(pattern) => pattern.replace(trimmed, "").trim().to_string(),
        None => trimmed.trim_end_matches(';').trim().to_string(),
    }
}

/// Validate that `sql` is a single read-only statement.
///
/// Returns the normalized statement on success.
pub fn validate_read_only(sql: &str) -> Result<String, SqlValidationError> {
    let normalized = normalize(sql);
    if normalized.is_empty() {
        return Err(SqlValidationError::Empty);
    }

    let lower = normalized.to_lowercase();
    if lower.contains(';') {
        return Err(SqlValidationError::MultipleStatements);
    }
    if !(lower.starts_with("select") || lower.starts_with("with")) {
        return Err(SqlValidationError::NotReadOnly);
    }
    if let Some(keyword) = find_forbidden_keyword(&lower) {
        return Err(SqlValidationError::ForbiddenKeyword(keyword));
    }

    Ok(normalized)
}

pub fn is_read_only(sql: &str) -> bool {
    validate_read_only(sql).is_ok()
}

fn find_forbidden_keyword(lower: &str) -> Option<String> {
    match &*FORBIDDEN_PATTERN {
        Some(pattern) => pattern.find(lower).map(|m| m.as_str().to_string()),
        None => FORBIDDEN_KEYWORDS
            .iter()
            .find(|k| lower.split(|c: char| !c.is_alphanumeric() && c != '_').any(|w| w == **k))
            .map(|k| k.to_string()),
    }
}

/// Wrap a statement that has no ` limit ` clause in an outer `LIMIT n`
pub fn enforce_limit(sql: &str, max_rows: usize) -> String {
    let trimmed = sql.trim();
    if trimmed.to_lowercase().contains(" limit ") {
        return trimmed.to_string();
    }
    format!("SELECT * FROM ({}) AS _sub LIMIT {}", trimmed, max_rows)
}
