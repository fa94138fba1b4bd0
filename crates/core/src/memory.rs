//! # Memory Engine
//!
//! Collaborator seam for context snapshot storage. The mediator dereferences
//! snapshot references through this trait during handoff; it is a black box
//! from the core's perspective and may fail with `NotFound` or `Timeout`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::params;

use crate::state::SynapseDb;

/// Memory engine failures the core handles
#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryError {
    #[error("snapshot not found: {0}")]
    NotFound(String),
    #[error("memory engine timed out retrieving: {0}")]
    Timeout(String),
    #[error("memory engine storage error: {0}")]
    Storage(String),
}

/// Snapshot store consumed by the mediator and agent endpoints
#[async_trait]
pub trait MemoryEngine: Send + Sync {
    async fn store(&self, entity_ref: &str, snapshot: serde_json::Value) -> Result<(), MemoryError>;
    async fn retrieve(&self, query: &str) -> Result<serde_json::Value, MemoryError>;
}

/// Process-local snapshot store
#[derive(Default)]
pub struct InMemorySnapshots {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl InMemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryEngine for InMemorySnapshots {
    async fn store(&self, entity_ref: &str, snapshot: serde_json::Value) -> Result<(), MemoryError> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(entity_ref.to_string(), snapshot);
        Ok(())
    }

    async fn retrieve(&self, query: &str) -> Result<serde_json::Value, MemoryError> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .get(query)
            .cloned()
            .ok_or_else(|| MemoryError::NotFound(query.to_string()))
    }
}

/// SQLite-backed snapshot store, persisted in the unified database
pub struct SqliteSnapshots {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteSnapshots {
    pub fn new(db: &SynapseDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }
}

#[async_trait]
impl MemoryEngine for SqliteSnapshots {
    async fn store(&self, entity_ref: &str, snapshot: serde_json::Value) -> Result<(), MemoryError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO snapshots (entity_ref, data, stored_at) VALUES (?1, ?2, datetime('now'))",
            params![entity_ref, snapshot.to_string()],
        )
        .map_err(|e| MemoryError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn retrieve(&self, query: &str) -> Result<serde_json::Value, MemoryError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM snapshots WHERE entity_ref = ?1",
                params![query],
                |row| row.get(0),
            )
            .ok();
        let raw = data.ok_or_else(|| MemoryError::NotFound(query.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| MemoryError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemorySnapshots::new();
        store
            .store("ctx-1", json!({ "goal": "ship it" }))
            .await
            .expect("store");
        let got = store.retrieve("ctx-1").await.expect("retrieve");
        assert_eq!(got["goal"], "ship it");
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_not_found() {
        let store = InMemorySnapshots::new();
        let err = store.retrieve("nope").await.expect_err("missing");
        assert!(matches!(err, MemoryError::NotFound(_)));
    }
}
