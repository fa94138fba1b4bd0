//! Session archive and lifecycle event log, both backed by [`SynapseDb`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::bus::Event;
use crate::orchestrator::SessionState;

use super::SynapseDb;

/// Row written when a session reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub goal: String,
    pub tier: String,
    pub state: SessionState,
    pub current_stage: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

pub struct SessionArchive<'a> {
    db: &'a SynapseDb,
}

impl<'a> SessionArchive<'a> {
    pub fn new(db: &'a SynapseDb) -> Self {
        Self { db }
    }

    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO sessions
                (session_id, goal, tier, state, current_stage, attempt_count,
                 last_error, created_at, closed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.session_id,
                record.goal,
                record.tier,
                record.state.as_str(),
                record.current_stage,
                record.attempt_count,
                record.last_error,
                record.created_at.to_rfc3339(),
                record.closed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<SessionRecord> {
        let conn = self.db.connection();
        let conn = conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.query_row(
            r#"
            SELECT session_id, goal, tier, state, current_stage, attempt_count,
                   last_error, created_at, closed_at
            FROM sessions WHERE session_id = ?1
            "#,
            params![session_id],
            row_to_record,
        )
        .with_context(|| format!("Session '{}' not found in archive", session_id))
    }

    /// Most recently closed sessions first
    pub fn list(&self, limit: u32) -> Result<Vec<SessionRecord>> {
        let conn = self.db.connection();
        let conn = conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, goal, tier, state, current_stage, attempt_count,
                   last_error, created_at, closed_at
            FROM sessions ORDER BY closed_at DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit], row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let state: String = row.get(3)?;
    let created: String = row.get(7)?;
    let closed: String = row.get(8)?;
    Ok(SessionRecord {
        session_id: row.get(0)?,
        goal: row.get(1)?,
        tier: row.get(2)?,
        state: parse_state(&state),
        current_stage: row.get(4)?,
        attempt_count: row.get(5)?,
        last_error: row.get(6)?,
        created_at: parse_time(&created),
        closed_at: parse_time(&closed),
    })
}

fn parse_state(text: &str) -> SessionState {
    match text {
        "active" => SessionState::Active,
        "paused" => SessionState::Paused,
        "completed" => SessionState::Completed,
        _ => SessionState::Stopped,
    }
}

fn parse_time(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Append-only log of lifecycle events
pub struct EventLog<'a> {
    db: &'a SynapseDb,
}

impl<'a> EventLog<'a> {
    pub fn new(db: &'a SynapseDb) -> Self {
        Self { db }
    }

    pub fn record(&self, event: &Event) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT OR IGNORE INTO events (id, topic, source_id, payload, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                event.id,
                event.topic,
                event.source_id,
                serde_json::to_string(&event.payload)?,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent events first
    pub fn recent(&self, limit: u32) -> Result<Vec<Event>> {
        let conn = self.db.connection();
        let conn = conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            "SELECT id, topic, source_id, payload, timestamp FROM events
             ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            let payload: String = row.get(3)?;
            let timestamp: String = row.get(4)?;
            Ok(Event {
                id: row.get(0)?,
                topic: row.get(1)?,
                source_id: row.get(2)?,
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                timestamp: parse_time(&timestamp),
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn record(id: &str, state: SessionState) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            goal: "ship the feature".to_string(),
            tier: "free".to_string(),
            state,
            current_stage: Some("review".to_string()),
            attempt_count: 1,
            last_error: None,
            created_at: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn test_archive_round_trip() {
        let path = ".synapse/test_archive.db";
        let _ = fs::remove_file(path);

        let db = SynapseDb::open_at(path).unwrap();
        let archive = SessionArchive::new(&db);

        archive
            .save(&record("sess-a1", SessionState::Completed))
            .unwrap();

        let loaded = archive.load("sess-a1").unwrap();
        assert_eq!(loaded.goal, "ship the feature");
        assert_eq!(loaded.state, SessionState::Completed);
        assert_eq!(loaded.current_stage.as_deref(), Some("review"));

        assert!(archive.load("sess-missing").is_err());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_archive_list_orders_by_close_time() {
        let path = ".synapse/test_archive_list.db";
        let _ = fs::remove_file(path);

        let db = SynapseDb::open_at(path).unwrap();
        let archive = SessionArchive::new(&db);

        let mut first = record("sess-b1", SessionState::Stopped);
        first.closed_at = Utc::now() - chrono::Duration::minutes(5);
        archive.save(&first).unwrap();
        archive
            .save(&record("sess-b2", SessionState::Completed))
            .unwrap();

        let listed = archive.list(10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].session_id, "sess-b2");

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_event_log_round_trip() {
        let path = ".synapse/test_event_log.db";
        let _ = fs::remove_file(path);

        let db = SynapseDb::open_at(path).unwrap();
        let log = EventLog::new(&db);

        let event = Event::new("session.started", "sess-c1", json!({"tier": "free"}));
        log.record(&event).unwrap();
        // Duplicate ids are ignored, not duplicated.
        log.record(&event).unwrap();

        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].topic, "session.started");
        assert_eq!(recent[0].payload["tier"], "free");

        let _ = fs::remove_file(path);
    }
}
