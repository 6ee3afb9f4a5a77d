//! Flow definition storage.
//!
//! Persists authored flows and their published versions. This store backs
//! the flow CRUD surface only; running sessions keep their own bound copy
//! of the definition in the session store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("flow not found: {0}")]
    FlowNotFound(String),
    #[error("invalid stored definition: {0}")]
    BadDefinition(#[from] serde_json::Error),
}

pub type DbResult<T> = Result<T, DbError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS flows (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    definition TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    published INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS flow_versions (
    flow_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    definition TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (flow_id, version)
);
";

#[derive(Debug, Clone, Serialize)]
pub struct FlowRecord {
    pub id: String,
    pub name: String,
    pub definition: Value,
    pub version: i64,
    pub published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowVersionRecord {
    pub flow_id: String,
    pub version: i64,
    pub definition: Value,
    pub created_at: DateTime<Utc>,
}

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (default when no path is configured)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn create_flow(&self, id: &str, name: &str, definition: &Value) -> DbResult<FlowRecord> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO flows (id, name, definition, version, published, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, 0, ?4, ?4)",
            params![id, name, definition.to_string(), now.to_rfc3339()],
        )?;

        Ok(FlowRecord {
            id: id.to_string(),
            name: name.to_string(),
            definition: definition.clone(),
            version: 1,
            published: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_flow(&self, id: &str) -> DbResult<FlowRecord> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, definition, version, published, created_at, updated_at
             FROM flows WHERE id = ?1",
        )?;
        stmt.query_row(params![id], parse_flow_row).map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::FlowNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    pub fn list_flows(&self) -> DbResult<Vec<FlowRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, definition, version, published, created_at, updated_at
             FROM flows ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], parse_flow_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Replace the working definition. Bumps the version and clears the
    /// published mark.
    pub fn update_flow(
        &self,
        id: &str,
        name: Option<&str>,
        definition: &Value,
    ) -> DbResult<FlowRecord> {
        {
            let conn = self.conn.lock().unwrap();
            let now = Utc::now();
            let changed = conn.execute(
                "UPDATE flows
                 SET name = COALESCE(?2, name),
                     definition = ?3,
                     version = version + 1,
                     published = 0,
                     updated_at = ?4
                 WHERE id = ?1",
                params![id, name, definition.to_string(), now.to_rfc3339()],
            )?;
            if changed == 0 {
                return Err(DbError::FlowNotFound(id.to_string()));
            }
        }
        self.get_flow(id)
    }

    pub fn delete_flow(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM flow_versions WHERE flow_id = ?1", params![id])?;
        conn.execute("DELETE FROM flows WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Snapshot the working definition as an immutable version and mark the
    /// flow published.
    pub fn publish_flow(&self, id: &str) -> DbResult<FlowRecord> {
        let flow = self.get_flow(id)?;
        {
            let conn = self.conn.lock().unwrap();
            let now = Utc::now();
            conn.execute(
                "INSERT OR REPLACE INTO flow_versions (flow_id, version, definition, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    flow.id,
                    flow.version,
                    flow.definition.to_string(),
                    now.to_rfc3339()
                ],
            )?;
            conn.execute(
                "UPDATE flows SET published = 1, updated_at = ?2 WHERE id = ?1",
                params![id, now.to_rfc3339()],
            )?;
        }
        self.get_flow(id)
    }

    pub fn list_versions(&self, id: &str) -> DbResult<Vec<FlowVersionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT flow_id, version, definition, created_at
             FROM flow_versions WHERE flow_id = ?1 ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut versions = Vec::new();
        for row in rows {
            let (flow_id, version, definition, created_at) = row?;
            versions.push(FlowVersionRecord {
                flow_id,
                version,
                definition: serde_json::from_str(&definition)?,
                created_at: parse_datetime(&created_at),
            });
        }
        Ok(versions)
    }
}

fn parse_flow_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowRecord> {
    let definition: String = row.get(2)?;
    Ok(FlowRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        definition: serde_json::from_str(&definition).unwrap_or(Value::Null),
        version: row.get(3)?,
        published: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        updated_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
