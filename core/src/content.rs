use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::task::{now_epoch, DownloadParams, TaskId, TaskState};

/// Durable descriptor of a download: everything needed to resume the
/// transfer after a restart, persisted as `<download_dir>/<taskId>.task`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskContent {
    pub task_id: TaskId,
    #[serde(rename = "type")]
    pub category: String,
    pub path_index: usize,
    pub filename: String,
    pub url: String,
    pub platform: Option<String>,
    pub size_bytes: u64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub trigger_words: Vec<String>,
    #[serde(default)]
    pub preview_urls: Vec<String>,
    pub created_at: u64,
}

impl TaskContent {
    pub fn from_params(task_id: TaskId, params: &DownloadParams, platform: Option<String>) -> Self {
        Self {
            task_id,
            category: params.category.clone(),
            path_index: params.path_index,
            filename: params.filename.clone(),
            url: params.url.clone(),
            platform,
            size_bytes: params.size_hint(),
            description: params.description.clone(),
            hashes: params.hashes.clone(),
            trigger_words: params.trigger_words.clone(),
            preview_urls: params.preview_urls.clone(),
            created_at: now_epoch(),
        }
    }

    /// Rebuild the typed parameters, used when a descriptor is restored
    /// after a restart.
    pub fn to_params(&self) -> DownloadParams {
        DownloadParams {
            url: self.url.clone(),
            category: self.category.clone(),
            filename: self.filename.clone(),
            path_index: self.path_index,
            platform: self.platform.clone(),
            size_bytes: Some(self.size_bytes),
            size_kb: None,
            description: self.description.clone(),
            hashes: self.hashes.clone(),
            trigger_words: self.trigger_words.clone(),
            preview_urls: self.preview_urls.clone(),
        }
    }
}

pub fn descriptor_path(download_dir: &Path, id: &TaskId) -> PathBuf {
    download_dir.join(format!("{}.task", id))
}

pub fn partial_path(download_dir: &Path, id: &TaskId) -> PathBuf {
    download_dir.join(format!("{}.download", id))
}

/// Live view of a transfer. Never a source of truth: it can always be
/// rebuilt from the descriptor and the partial file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: TaskId,
    #[serde(rename = "type")]
    pub category: String,
    pub filename: String,
    pub platform: Option<String>,
    pub state: TaskState,
    pub downloaded_size: u64,
    pub total_size: u64,
    pub progress: f64,
    pub bps: f64,
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn set_bytes(&mut self, downloaded: u64, total: u64) {
        self.downloaded_size = downloaded;
        self.total_size = total;
        self.progress = progress_percent(downloaded, total);
    }
}

pub fn progress_percent(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((downloaded as f64 / total as f64) * 100.0).min(100.0)
}

/// Rebuild a [`TaskStatus`] from the descriptor and whatever partial file is
/// on disk. Used after a restart and whenever the in-memory view is gone.
pub fn recompute(content: &TaskContent, download_dir: &Path) -> TaskStatus {
    let downloaded = fs::metadata(partial_path(download_dir, &content.task_id))
        .map(|meta| meta.len())
        .unwrap_or(0);
    let total = content.size_bytes;
    let downloaded = if total > 0 { downloaded.min(total) } else { downloaded };
    TaskStatus {
        task_id: content.task_id,
        category: content.category.clone(),
        filename: content.filename.clone(),
        platform: content.platform.clone(),
        state: TaskState::Paused,
        downloaded_size: downloaded,
        total_size: total,
        progress: progress_percent(downloaded, total),
        bps: 0.0,
        error: None,
    }
}
