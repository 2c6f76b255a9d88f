//! Session: a named, durable collection of top-level tasks (spec §4.7, §6).
//!
//! A Session is the Engine's anchor to a Store: it tracks which top-level
//! nodes belong to a named run and, on disk, a small amount of bookkeeping
//! the Store itself doesn't know about (which store it points at, when it
//! started and ended). Grounded in the teacher's `Storage::register`
//! directory-per-area idiom (`common/src/storage.rs`): one directory
//! created on first use and reopened transparently on every later run,
//! generalized from "an area for cached files" to "the area a campaign's
//! bookkeeping lives in".

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::engine::Engine;
use crate::error::{Gc3Error, StoreError};
use crate::store::{self, Store};
use crate::task::{State, TaskId};

const STORE_URL_FILE: &str = "store.url";
const START_FILE: &str = "session.start_timestamp";
const END_FILE: &str = "session.end_timestamp";
const LOG_FILE: &str = "session.log";

/// A named run, backed by a [`Store`] plus a small bookkeeping directory
/// (§6). Cloning a `Store` handle is cheap (`Arc`), so a `Session` can be
/// handed to an `Engine` and queried independently at the same time.
#[derive(Debug)]
pub struct Session {
    name: String,
    dir: PathBuf,
    store: Arc<dyn Store>,
    store_url: String,
    started_at: DateTime<Utc>,
}

impl Session {
    /// Create a brand-new session rooted at `base_dir/<name>` (§6). Does
    /// not refuse to overwrite an existing directory at that path: `close`
    /// followed by `create` under the same name is a legitimate way to
    /// start a fresh campaign that reuses a directory, and the Store the
    /// new session points at is whatever `store_url` now names.
    pub async fn create(
        base_dir: impl AsRef<Path>,
        name: impl Into<String>,
        store_url: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let name = name.into();
        let store_url = store_url.into();
        let dir = base_dir.as_ref().join(&name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Write(dir.clone(), e))?;

        let started_at = Utc::now();
        write_file(&dir.join(STORE_URL_FILE), store_url.as_bytes()).await?;
        write_file(&dir.join(START_FILE), started_at.to_rfc3339().as_bytes()).await?;
        // A freshly created session is never already ended, even if a
        // directory is being reused after `close`.
        let _ = tokio::fs::remove_file(dir.join(END_FILE)).await;

        let store: Arc<dyn Store> = Arc::from(store::open(&store_url)?);
        Ok(Session { name, dir, store, store_url, started_at })
    }

    /// Reopen a session previously created at `base_dir/<name>` (§6 resume
    /// scenario, §8 S5): reads back `store.url`/`session.start_timestamp`
    /// and reopens the Store they name. Reopening a session whose
    /// `session.end_timestamp` is already present still succeeds; callers
    /// that care check [`Session::ended_at`] themselves.
    pub async fn open(base_dir: impl AsRef<Path>, name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        let dir = base_dir.as_ref().join(&name);
        let store_url = read_file_to_string(&dir.join(STORE_URL_FILE)).await?;
        let started_raw = read_file_to_string(&dir.join(START_FILE)).await?;
        let started_at = DateTime::parse_from_rfc3339(started_raw.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let store: Arc<dyn Store> = Arc::from(store::open(&store_url)?);
        Ok(Session { name, dir, store, store_url, started_at })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn store_url(&self) -> &str {
        &self.store_url
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn ended_at(&self) -> Option<DateTime<Utc>> {
        let raw = read_file_to_string(&self.dir.join(END_FILE)).await.ok()?;
        DateTime::parse_from_rfc3339(raw.trim()).ok().map(|dt| dt.with_timezone(&Utc))
    }

    /// Record `id` as a top-level node of this session (§4.7). Idempotent,
    /// since the underlying `Store::index_in_session` is.
    pub async fn add(&self, id: &TaskId) -> Result<(), StoreError> {
        self.store.index_in_session(&self.name, id).await
    }

    /// Every top-level node id belonging to this session (§6).
    pub async fn list(&self) -> Result<Vec<TaskId>, StoreError> {
        self.store.list_session(&self.name).await
    }

    /// Append a free-form line to the session's own log. Distinct from a
    /// Task's history (§3): this is narration at the session's level
    /// ("created", "aborted", ...), kept as a plain append-only text file.
    pub async fn log(&self, message: impl AsRef<str>) -> Result<(), StoreError> {
        let path = self.dir.join(LOG_FILE);
        let mut existing = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StoreError::Read(path.clone(), e)),
        };
        existing.extend_from_slice(format!("{} {}\n", Utc::now().to_rfc3339(), message.as_ref()).as_bytes());
        write_file(&path, &existing).await
    }

    /// Abort the session (§4.7): kill every non-terminal top-level task this
    /// session owns, drive `engine` until they all reach
    /// [`State::Terminated`], then record the end timestamp. Unlike
    /// [`Session::close`], callers don't need to have drained the Engine
    /// themselves first; `abort` does that draining as part of killing.
    pub async fn abort(&self, engine: &Engine) -> Result<(), Gc3Error> {
        let top_level = self.list().await?;
        for id in &top_level {
            engine.kill(id.clone()).await?;
        }
        loop {
            engine.progress().await?;
            let snapshot = engine.snapshot().await?;
            let all_terminal = top_level.iter().all(|id| {
                match snapshot.iter().find(|(sid, ..)| sid == id) {
                    Some((_, _, state, _)) => *state == State::Terminated,
                    // Already forgotten by the Engine (`forget_terminated`):
                    // it can only have been dropped after going terminal.
                    None => true,
                }
            });
            if all_terminal {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        self.log("aborted").await?;
        write_file(&self.dir.join(END_FILE), Utc::now().to_rfc3339().as_bytes()).await?;
        Ok(())
    }

    /// Mark the session cleanly closed (§6). Idempotent: closing an
    /// already-closed session just rewrites the same end-timestamp file.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.log("closed").await?;
        write_file(&self.dir.join(END_FILE), Utc::now().to_rfc3339().as_bytes()).await
    }

    /// Permanently remove every task this session knows about from the
    /// Store, then the session's own bookkeeping directory (§6: "delete"
    /// is irreversible and distinct from `close`).
    pub async fn delete(self) -> Result<(), StoreError> {
        for id in self.list().await? {
            self.store.remove(&id).await?;
        }
        tokio::fs::remove_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Write(self.dir.clone(), e))?;
        Ok(())
    }
}

async fn write_file(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut f = tokio::fs::File::create(path)
        .await
        .map_err(|e| StoreError::Write(path.to_path_buf(), e))?;
    f.write_all(data).await.map_err(|e| StoreError::Write(path.to_path_buf(), e))?;
    f.flush().await.map_err(|e| StoreError::Write(path.to_path_buf(), e))?;
    Ok(())
}

async fn read_file_to_string(path: &Path) -> Result<String, StoreError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StoreError::Read(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Requirements, Spec, Task};
    use std::collections::BTreeMap;

    fn sample_task() -> Task {
        Task::new(
            "echo-hello",
            Spec {
                command: "/bin/echo".into(),
                arguments: vec!["hello".into()],
                inputs: BTreeMap::new(),
                outputs: vec![],
                stdin: None,
                stdout: Some("stdout.txt".into()),
                stderr: None,
                join_stdout_stderr: false,
                environment: BTreeMap::new(),
                requirements: Requirements {
                    cores: 1,
                    memory_per_core: gc3_common::Quantity::memory(512, gc3_common::MemoryUnit::MiB),
                    walltime: gc3_common::Quantity::time(1, gc3_common::TimeUnit::Hours),
                    architecture: vec![],
                    tags: vec![],
                },
            },
        )
    }

    #[tokio::test]
    async fn create_then_open_round_trips() {
        let base = tempfile::tempdir().unwrap();
        let store_dir = base.path().join("store");
        let store_url = format!("file://{}", store_dir.display());

        let created = Session::create(base.path(), "demo", &store_url).await.unwrap();
        assert_eq!(created.name(), "demo");
        assert!(created.ended_at().await.is_none());

        let reopened = Session::open(base.path(), "demo").await.unwrap();
        assert_eq!(reopened.store_url(), store_url);
        assert_eq!(reopened.started_at(), created.started_at());
    }

    #[tokio::test]
    async fn add_and_list_round_trips_through_the_store() {
        let base = tempfile::tempdir().unwrap();
        let store_url = format!("file://{}", base.path().join("store").display());
        let session = Session::create(base.path(), "demo", &store_url).await.unwrap();

        let task = sample_task();
        session.store().save_task(&task).await.unwrap();
        session.add(&task.id).await.unwrap();
        session.add(&task.id).await.unwrap();

        assert_eq!(session.list().await.unwrap(), vec![task.id]);
    }

    #[tokio::test]
    async fn close_records_an_end_timestamp() {
        let base = tempfile::tempdir().unwrap();
        let store_url = format!("file://{}", base.path().join("store").display());
        let session = Session::create(base.path(), "demo", &store_url).await.unwrap();

        assert!(session.ended_at().await.is_none());
        session.close().await.unwrap();
        assert!(session.ended_at().await.is_some());
    }

    #[tokio::test]
    async fn delete_removes_tasks_and_the_session_directory() {
        let base = tempfile::tempdir().unwrap();
        let store_url = format!("file://{}", base.path().join("store").display());
        let session = Session::create(base.path(), "demo", &store_url).await.unwrap();

        let task = sample_task();
        let store = session.store();
        store.save_task(&task).await.unwrap();
        session.add(&task.id).await.unwrap();

        session.delete().await.unwrap();
        assert!(store.load_task(&task.id).await.is_err());
        assert!(!base.path().join("demo").exists());
    }
}
