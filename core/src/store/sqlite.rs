//! SQLite `Store` back-end (spec §4.7): the "transactional insert/update on
//! SQL back-ends" half of the Store contract. Task payloads are stored as a
//! JSON blob keyed by persistent id — the schema itself doesn't need to
//! know Task's shape, only `Store::save_task`/`load_task` do, which keeps
//! the schema-evolution hook (`gc3_common::Versioned`) the single place
//! that cares about field-level changes.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};

use crate::error::StoreError;
use crate::task::{Task, TaskId};

use super::Store;

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Write(parent.to_path_buf(), e))?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                schema_version INTEGER NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_index (
                session TEXT NOT NULL,
                task_id TEXT NOT NULL,
                PRIMARY KEY (session, task_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            )",
            [],
        )?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_task(&self, task: &Task) -> Result<TaskId, StoreError> {
        let payload = serde_json::to_string(task)?;
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute(
            "INSERT INTO tasks (id, schema_version, payload) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET schema_version = excluded.schema_version, payload = excluded.payload",
            params![task.id.0, task.schema_version as i64, payload],
        )?;
        Ok(task.id.clone())
    }

    async fn load_task(&self, id: &TaskId) -> Result<Task, StoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let payload: String = conn
            .query_row("SELECT payload FROM tasks WHERE id = ?1", params![id.0], |row| row.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(id.0.clone()),
                other => StoreError::Sqlite(other),
            })?;
        super::decode_task(payload.as_bytes())
    }

    async fn list_session(&self, session: &str) -> Result<Vec<TaskId>, StoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let mut stmt = conn.prepare("SELECT task_id FROM session_index WHERE session = ?1")?;
        let ids = stmt
            .query_map(params![session], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(TaskId).collect())
    }

    async fn remove(&self, id: &TaskId) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.0])?;
        Ok(())
    }

    async fn index_in_session(&self, session: &str, id: &TaskId) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO session_index (session, task_id) VALUES (?1, ?2)",
            params![session, id.0],
        )?;
        Ok(())
    }

    async fn save_group_record(&self, id: &TaskId, data: &[u8]) -> Result<(), StoreError> {
        let payload = String::from_utf8_lossy(data).into_owned();
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute(
            "INSERT INTO groups (id, payload) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
            params![id.0, payload],
        )?;
        Ok(())
    }

    async fn load_group_record(&self, id: &TaskId) -> Result<Vec<u8>, StoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let payload: String = conn
            .query_row("SELECT payload FROM groups WHERE id = ?1", params![id.0], |row| row.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(id.0.clone()),
                other => StoreError::Sqlite(other),
            })?;
        Ok(payload.into_bytes())
    }
}
