//! Storage contract and the hierarchical file store
//!
//! Layout under the base directory:
//!
//! ```text
//! secretaries/{secretary_id}/secretary.json
//! secretaries/{secretary_id}/tasks/{task_id}.json
//! templates/{template_id}.json
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StorageError, StorageResult, ValidationError};
use crate::types::{RemoteTask, Secretary, SecretaryInfo, TaskTemplate};

const SECRETARIES_DIR: &str = "secretaries";
const TASKS_DIR: &str = "tasks";
const TEMPLATES_DIR: &str = "templates";
const SECRETARY_FILE: &str = "secretary.json";

/// Read side of the record store consumed by the gateway at startup
#[async_trait]
pub trait Storage: Send + Sync {
    async fn list_secretary_infos(&self) -> StorageResult<Vec<SecretaryInfo>>;

    async fn load_secretary(&self, id: &str) -> StorageResult<Secretary>;

    async fn list_tasks(&self, secretary_id: &str) -> StorageResult<Vec<RemoteTask>>;

    async fn load_task(&self, secretary_id: &str, task_id: &str) -> StorageResult<RemoteTask>;
}

/// JSON files on a hierarchical directory tree
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn secretary_dir(&self, id: &str) -> StorageResult<PathBuf> {
        check_id(id)?;
        Ok(self.base_dir.join(SECRETARIES_DIR).join(id))
    }

    fn task_path(&self, secretary_id: &str, task_id: &str) -> StorageResult<PathBuf> {
        check_id(task_id)?;
        Ok(self
            .secretary_dir(secretary_id)?
            .join(TASKS_DIR)
            .join(format!("{}.json", task_id)))
    }

    pub async fn save_secretary(&self, secretary: &Secretary) -> StorageResult<()> {
        let path = self.secretary_dir(&secretary.id)?.join(SECRETARY_FILE);
        write_json(&path, secretary).await
    }

    pub async fn save_task(&self, task: &RemoteTask) -> StorageResult<()> {
        let path = self.task_path(&task.secretary_id, &task.id)?;
        write_json(&path, task).await
    }

    pub async fn save_template(&self, template: &TaskTemplate) -> StorageResult<()> {
        check_id(&template.id)?;
        let path = self
            .base_dir
            .join(TEMPLATES_DIR)
            .join(format!("{}.json", template.id));
        write_json(&path, template).await
    }

    pub async fn load_template(&self, id: &str) -> StorageResult<TaskTemplate> {
        check_id(id)?;
        let path = self.base_dir.join(TEMPLATES_DIR).join(format!("{}.json", id));
        read_json(&path).await
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn list_secretary_infos(&self) -> StorageResult<Vec<SecretaryInfo>> {
        let root = self.base_dir.join(SECRETARIES_DIR);
        let mut infos = Vec::new();

        for entry in list_dir(&root).await? {
            let path = entry.join(SECRETARY_FILE);
            match read_json::<Secretary>(&path).await {
                Ok(secretary) => infos.push(secretary.info()),
                Err(StorageError::NotFound(_)) => {
                    tracing::debug!(path = %entry.display(), "Skipping directory without secretary record");
                }
                Err(e) => return Err(e),
            }
        }

        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn load_secretary(&self, id: &str) -> StorageResult<Secretary> {
        let path = self.secretary_dir(id)?.join(SECRETARY_FILE);
        read_json(&path).await
    }

    async fn list_tasks(&self, secretary_id: &str) -> StorageResult<Vec<RemoteTask>> {
        let dir = self.secretary_dir(secretary_id)?.join(TASKS_DIR);
        let mut tasks = Vec::new();

        for path in list_dir(&dir).await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            tasks.push(read_json::<RemoteTask>(&path).await?);
        }

        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn load_task(&self, secretary_id: &str, task_id: &str) -> StorageResult<RemoteTask> {
        let path = self.task_path(secretary_id, task_id)?;
        read_json(&path).await
    }
}

/// Ids become path components, so they must not escape their directory
fn check_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(ValidationError::InvalidId(id.to_string()));
    }
    Ok(())
}

async fn list_dir(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    Ok(paths)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StorageError::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice(&bytes).map_err(|source| StorageError::Malformed {
        path: path.display().to_string(),
        source,
    })
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Malformed {
        path: path.display().to_string(),
        source,
    })?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}
