use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::content::{descriptor_path, TaskContent};
use crate::error::{CoreError, CoreResult};
use crate::task::TaskId;

/// Durable home of download descriptors. Callers serialize access through
/// one coarse lock, so implementations need not be internally synchronized.
pub trait Storage: Send + Sync {
    fn save_content(&mut self, content: &TaskContent) -> CoreResult<()>;
    fn load_content(&self, id: &TaskId) -> CoreResult<TaskContent>;
    fn list_contents(&self) -> CoreResult<Vec<TaskContent>>;
    fn delete_content(&mut self, id: &TaskId) -> CoreResult<()>;
}

#[derive(Default)]
pub struct MemoryStorage {
    contents: HashMap<TaskId, TaskContent>,
}

impl Storage for MemoryStorage {
    fn save_content(&mut self, content: &TaskContent) -> CoreResult<()> {
        self.contents.insert(content.task_id, content.clone());
        Ok(())
    }

    fn load_content(&self, id: &TaskId) -> CoreResult<TaskContent> {
        self.contents
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("task {}", id)))
    }

    fn list_contents(&self) -> CoreResult<Vec<TaskContent>> {
        Ok(self.contents.values().cloned().collect())
    }

    fn delete_content(&mut self, id: &TaskId) -> CoreResult<()> {
        self.contents.remove(id);
        Ok(())
    }
}

/// One `<id>.task` JSON file per download in the download directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            CoreError::Storage(format!("cannot create {}: {}", dir.display(), err))
        })?;
        Ok(Self { dir })
    }
}

impl Storage for FileStorage {
    fn save_content(&mut self, content: &TaskContent) -> CoreResult<()> {
        let path = descriptor_path(&self.dir, &content.task_id);
        let tmp = path.with_extension("task.tmp");
        let data = serde_json::to_vec_pretty(content)?;
        fs::write(&tmp, data).map_err(|err| CoreError::Storage(err.to_string()))?;
        fs::rename(&tmp, &path).map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn load_content(&self, id: &TaskId) -> CoreResult<TaskContent> {
        let path = descriptor_path(&self.dir, id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(format!("task {}", id)))
            }
            Err(err) => return Err(CoreError::Storage(err.to_string())),
        };
        serde_json::from_slice(&data)
            .map_err(|err| CoreError::Storage(format!("corrupt descriptor {}: {}", path.display(), err)))
    }

    fn list_contents(&self) -> CoreResult<Vec<TaskContent>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| CoreError::Storage(err.to_string()))?;
        let mut contents = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CoreError::Storage(err.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("task") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| TaskId::parse_str(stem).ok())
            else {
                continue;
            };
            match self.load_content(&id) {
                Ok(content) => contents.push(content),
                Err(err) => tracing::warn!(task_id = %id, "skipping unreadable descriptor: {}", err),
            }
        }
        contents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(contents)
    }

    fn delete_content(&mut self, id: &TaskId) -> CoreResult<()> {
        match fs::remove_file(descriptor_path(&self.dir, id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CoreError::Storage(err.to_string())),
        }
    }
}
