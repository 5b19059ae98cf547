//! Preview cache for generated statements
//!
//! `text2sql` stores each candidate under a short id so a later
//! `execute_generated_sql` can run exactly what was previewed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::planner::CandidateStatement;

/// Default lifetime of a preview
pub const DEFAULT_PREVIEW_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct PreviewEntry {
    pub statement: CandidateStatement,
    pub question: String,
    pub created_at: Instant,
}

pub struct PreviewCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, PreviewEntry>>,
}

impl Default for PreviewCache {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_TTL)
    }
}

/// `p_` followed by ten hex characters
pub fn new_preview_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("p_{}", &hex[..10])
}

impl PreviewCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a statement and return its preview id
    pub fn insert(&self, statement: CandidateStatement, question: impl Into<String>) -> String {
        let id = new_preview_id();
        let entry = PreviewEntry {
            statement,
            question: question.into(),
            created_at: Instant::now(),
        };
        self.lock().insert(id.clone(), entry);
        id
    }

    /// Look up a preview, evicting it if it has expired
    pub fn get(&self, id: &str) -> Option<PreviewEntry> {
        let mut entries = self.lock();
        let expired = entries.get(id)?.created_at.elapsed() > self.ttl;
        if expired {
            entries.remove(id);
            return None;
        }
        entries.get(id).cloned()
    }

    /// Remove every expired preview; returns how many were dropped
    pub fn sweep(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at.elapsed() <= self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sweep on an interval of at least a minute, or a tenth of the TTL
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let every = (self.ttl / 10).max(Duration::from_secs(60));
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else { break };
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(removed, "Swept expired previews");
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PreviewEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement() -> CandidateStatement {
        CandidateStatement::new("SELECT 1 AS ok", Vec::new())
    }

    #[test]
    fn test_preview_id_format() {
        let id = new_preview_id();
        assert_eq!(id.len(), 12);
        assert!(id.starts_with("p_"));
        assert!(id[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_insert_and_get() {
        let cache = PreviewCache::default();
        let id = cache.insert(statement(), "anything");
        let entry = cache.get(&id).unwrap();
        assert_eq!(entry.statement.sql, "SELECT 1 AS ok");
        assert_eq!(entry.question, "anything");
        assert!(cache.get("p_0000000000").is_none());
    }

    #[test]
    fn test_expired_previews_are_evicted() {
        let cache = PreviewCache::new(Duration::from_millis(10));
        let id = cache.insert(statement(), "q");
        cache.insert(statement(), "q");
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get(&id).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }
}
