//! Directory-tree `Store` back-end (spec §4.7, §6): one JSON file per
//! object under `<root>/tasks/<id>.json` and `<root>/groups/<id>.json`,
//! plus one `<root>/sessions/<name>` index file (one task id per line).
//! Grounded on the teacher's `Storage::register` directory-creation idiom
//! (`engine/src/storage.rs`), generalized from "a configured area" to "the
//! one store a Session points at".

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;
use crate::task::{Task, TaskId};

use super::Store;

#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(root.join("tasks")).map_err(|e| StoreError::Write(root.clone(), e))?;
        std::fs::create_dir_all(root.join("groups")).map_err(|e| StoreError::Write(root.clone(), e))?;
        std::fs::create_dir_all(root.join("sessions")).map_err(|e| StoreError::Write(root.clone(), e))?;
        Ok(DirectoryStore { root })
    }

    fn task_path(&self, id: &TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{}.json", id.0))
    }

    fn session_index_path(&self, session: &str) -> PathBuf {
        self.root.join("sessions").join(session)
    }

    /// Write `data` to `path` atomically: write to a sibling temp file, then
    /// rename over the destination (§4.7: "write atomically (rename-over-
    /// temp on filesystem back-ends)").
    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StoreError::Write(tmp.clone(), e))?;
        f.write_all(data).await.map_err(|e| StoreError::Write(tmp.clone(), e))?;
        f.flush().await.map_err(|e| StoreError::Write(tmp.clone(), e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Write(path.to_path_buf(), e))?;
        Ok(())
    }
}

#[async_trait]
impl Store for DirectoryStore {
    async fn save_task(&self, task: &Task) -> Result<TaskId, StoreError> {
        let path = self.task_path(&task.id);
        let data = serde_json::to_vec_pretty(task)?;
        Self::write_atomic(&path, &data).await?;
        Ok(task.id.clone())
    }

    async fn load_task(&self, id: &TaskId) -> Result<Task, StoreError> {
        let path = self.task_path(id);
        let data = tokio::fs::read(&path).await.map_err(|e| StoreError::Read(path.clone(), e))?;
        super::decode_task(&data)
    }

    async fn list_session(&self, session: &str) -> Result<Vec<TaskId>, StoreError> {
        let path = self.session_index_path(session);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await.map_err(|e| StoreError::Read(path, e))?;
        Ok(data.lines().filter(|l| !l.is_empty()).map(|l| TaskId(l.to_string())).collect())
    }

    async fn remove(&self, id: &TaskId) -> Result<(), StoreError> {
        let path = self.task_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Write(path, e)),
        }
    }

    async fn index_in_session(&self, session: &str, id: &TaskId) -> Result<(), StoreError> {
        let path = self.session_index_path(session);
        let mut existing = if path.exists() {
            tokio::fs::read_to_string(&path).await.map_err(|e| StoreError::Read(path.clone(), e))?
        } else {
            String::new()
        };
        if existing.lines().any(|l| l == id.0) {
            return Ok(());
        }
        if !existing.is_empty() && !existing.ends_with('\n') {
            existing.push('\n');
        }
        existing.push_str(&id.0);
        existing.push('\n');
        Self::write_atomic(&path, existing.as_bytes()).await
    }

    async fn save_group_record(&self, id: &TaskId, data: &[u8]) -> Result<(), StoreError> {
        let path = self.root.join("groups").join(format!("{}.json", id.0));
        Self::write_atomic(&path, data).await
    }

    async fn load_group_record(&self, id: &TaskId) -> Result<Vec<u8>, StoreError> {
        let path = self.root.join("groups").join(format!("{}.json", id.0));
        tokio::fs::read(&path).await.map_err(|e| StoreError::Read(path, e))
    }
}
