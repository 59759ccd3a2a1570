use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::event_store::{EventRecord, EventStore, RecordContent, RecordFilter};

const LAST_REFLECTION_STATE_KEY: &str = "last_reflection_time";

/// SQLite-backed interaction log and agent state.
pub struct AgentDatabase {
    conn: Mutex<Connection>,
}

impl AgentDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// In-memory database, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS event_records (
                id TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                author_ref TEXT,
                room_ref TEXT,
                scope_ref TEXT,
                created_at INTEGER NOT NULL,
                content TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_event_records_table_created ON event_records(table_name, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_event_records_scope ON event_records(scope_ref)",
            [],
        )?;

        Ok(())
    }

    pub fn insert_record(&self, table: &str, record: &EventRecord) -> Result<String> {
        let content_json =
            serde_json::to_string(&record.content).context("Failed to serialize record content")?;
        let id = if record.id.trim().is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            record.id.clone()
        };

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO event_records (id, table_name, author_ref, room_ref, scope_ref, created_at, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                table,
                record.author_ref,
                record.room_ref,
                record.scope_ref,
                record.created_at,
                content_json
            ],
        )
        .with_context(|| format!("Failed to append record {} to {}", id, table))?;
        Ok(id)
    }

    pub fn list_records(&self, filter: &RecordFilter) -> Result<Vec<EventRecord>> {
        if filter.count == 0 {
            return Ok(Vec::new());
        }
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, author_ref, room_ref, scope_ref, created_at, content
             FROM event_records
             WHERE table_name = ?1 AND (?2 IS NULL OR scope_ref = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;

        let records = stmt
            .query_map(
                params![filter.table, filter.scope, i64::try_from(filter.count).unwrap_or(i64::MAX)],
                record_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    pub fn find_record(&self, id: &str) -> Result<Option<EventRecord>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, author_ref, room_ref, scope_ref, created_at, content
             FROM event_records WHERE id = ?1",
            [id],
            record_from_row,
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn count_records(&self, table: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM event_records WHERE table_name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT value FROM agent_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO agent_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_last_reflection_time(&self) -> Result<Option<DateTime<Utc>>> {
        match self.get_state(LAST_REFLECTION_STATE_KEY)? {
            Some(raw) => {
                let parsed = DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("Invalid last reflection time: {}", raw))?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    pub fn set_last_reflection_time(&self, time: DateTime<Utc>) -> Result<()> {
        self.set_state(LAST_REFLECTION_STATE_KEY, &time.to_rfc3339())
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let content_raw: String = row.get(5)?;
    let content: RecordContent = serde_json::from_str(&content_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(EventRecord {
        id: row.get(0)?,
        author_ref: row.get(1)?,
        room_ref: row.get(2)?,
        scope_ref: row.get(3)?,
        created_at: row.get(4)?,
        content,
    })
}

#[async_trait]
impl EventStore for AgentDatabase {
    async fn get_records(&self, filter: &RecordFilter) -> Result<Vec<EventRecord>> {
        self.list_records(filter)
    }

    async fn get_record_by_id(&self, id: &str) -> Result<Option<EventRecord>> {
        self.find_record(id)
    }

    async fn append_record(&self, table: &str, record: &EventRecord) -> Result<String> {
        self.insert_record(table, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::MESSAGES_TABLE;
    use serde_json::json;

    fn record(id: &str, scope: &str, created_at: i64, text: &str) -> EventRecord {
        EventRecord {
            id: id.to_string(),
            author_ref: Some("user-1".to_string()),
            room_ref: Some("room-1".to_string()),
            scope_ref: Some(scope.to_string()),
            created_at,
            content: RecordContent {
                text: Some(text.to_string()),
                data: Some(json!({ "username": "pat" })),
                ..RecordContent::default()
            },
        }
    }

    #[test]
    fn records_round_trip_newest_first_with_scope() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = AgentDatabase::new(dir.path().join("events.db")).expect("db init");

        db.insert_record(MESSAGES_TABLE, &record("a", "agent-1", 1_000, "first"))
            .expect("insert a");
        db.insert_record(MESSAGES_TABLE, &record("b", "agent-1", 2_000, "second"))
            .expect("insert b");
        db.insert_record(MESSAGES_TABLE, &record("c", "agent-2", 3_000, "other agent"))
            .expect("insert c");

        let scoped = db
            .list_records(&RecordFilter::new(MESSAGES_TABLE, Some("agent-1"), 10))
            .expect("list");
        assert_eq!(
            scoped.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
        assert_eq!(scoped[0].data_str("username"), Some("pat"));

        let unscoped = db
            .list_records(&RecordFilter::new(MESSAGES_TABLE, None, 2))
            .expect("list all");
        assert_eq!(unscoped.len(), 2);
        assert_eq!(unscoped[0].id, "c");

        let none = db
            .list_records(&RecordFilter::new(MESSAGES_TABLE, None, 0))
            .expect("list none");
        assert!(none.is_empty());

        assert_eq!(db.count_records(MESSAGES_TABLE).expect("count"), 3);
        assert!(db.find_record("missing").expect("find").is_none());
        assert_eq!(
            db.find_record("a").expect("find").map(|r| r.text().to_string()),
            Some("first".to_string())
        );
    }

    #[test]
    fn last_reflection_time_persists() {
        let db = AgentDatabase::open_in_memory().expect("db init");
        assert!(db.get_last_reflection_time().expect("read").is_none());

        let now = Utc::now();
        db.set_last_reflection_time(now).expect("write");
        let stored = db.get_last_reflection_time().expect("read").expect("time");
        assert_eq!(stored.timestamp(), now.timestamp());
    }
}
