use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::platform::{detect_platform, Platform};

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    DownloadModel,
    ScanModels,
    UpdateMetadata,
    ScanInformation,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::DownloadModel => "download_model",
            TaskKind::ScanModels => "scan_models",
            TaskKind::UpdateMetadata => "update_metadata",
            TaskKind::ScanInformation => "scan_information",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "download_model" => Some(TaskKind::DownloadModel),
            "scan_models" => Some(TaskKind::ScanModels),
            "update_metadata" => Some(TaskKind::UpdateMetadata),
            "scan_information" => Some(TaskKind::ScanInformation),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Paused,
    Completed,
    Error,
    Cancelled,
    ModelExists,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Error => "error",
            TaskState::Cancelled => "cancelled",
            TaskState::ModelExists => "model_exists",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskState::Pending),
            "running" => Some(TaskState::Running),
            "paused" => Some(TaskState::Paused),
            "completed" => Some(TaskState::Completed),
            "error" => Some(TaskState::Error),
            "cancelled" => Some(TaskState::Cancelled),
            "model_exists" => Some(TaskState::ModelExists),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Error | TaskState::Cancelled | TaskState::ModelExists
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DownloadParams {
    pub url: String,
    #[serde(rename = "type")]
    pub category: String,
    pub filename: String,
    #[serde(default)]
    pub path_index: usize,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub size_kb: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub trigger_words: Vec<String>,
    #[serde(default)]
    pub preview_urls: Vec<String>,
}

impl DownloadParams {
    /// Caller-supplied size in bytes; `sizeBytes` wins over `sizeKb`.
    pub fn size_hint(&self) -> u64 {
        if let Some(bytes) = self.size_bytes {
            return bytes;
        }
        match self.size_kb {
            Some(kb) if kb.is_finite() && kb > 0.0 => (kb * 1024.0).round() as u64,
            _ => 0,
        }
    }

    /// Explicit platform, else the one implied by the URL host.
    pub fn resolved_platform(&self) -> CoreResult<Option<Platform>> {
        match self.platform.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Platform::from_str(name)
                .map(Some)
                .ok_or_else(|| CoreError::Validation(format!("unknown download platform: {}", name))),
            _ => Ok(detect_platform(&self.url)),
        }
    }

    fn validate(&self) -> CoreResult<()> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|err| CoreError::Validation(format!("invalid url {}: {}", self.url, err)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(CoreError::Validation(format!(
                "unsupported url scheme: {}",
                parsed.scheme()
            )));
        }
        if self.category.trim().is_empty() {
            return Err(CoreError::Validation("type is required".to_string()));
        }
        let name = self.filename.trim();
        if name.is_empty() || name != self.filename {
            return Err(CoreError::Validation(format!("invalid filename: {:?}", self.filename)));
        }
        if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
            return Err(CoreError::Validation(format!(
                "filename must not contain path separators: {}",
                name
            )));
        }
        if let Some(kb) = self.size_kb {
            if !kb.is_finite() || kb < 0.0 {
                return Err(CoreError::Validation(format!("invalid sizeKb: {}", kb)));
            }
        }
        self.resolved_platform()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScanParams {
    pub folder: String,
    #[serde(default)]
    pub include_hidden: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetadataParams {
    pub model_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScanInformationParams {
    pub mode: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// Typed parameters, one variant per task kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum TaskParams {
    DownloadModel(DownloadParams),
    ScanModels(ScanParams),
    UpdateMetadata(MetadataParams),
    ScanInformation(ScanInformationParams),
}

impl TaskParams {
    pub fn parse(kind: TaskKind, value: Value) -> CoreResult<Self> {
        let invalid = |err: serde_json::Error| CoreError::Validation(format!("{}: {}", kind, err));
        let params = match kind {
            TaskKind::DownloadModel => {
                let params: DownloadParams = serde_json::from_value(value).map_err(invalid)?;
                params.validate()?;
                TaskParams::DownloadModel(params)
            }
            TaskKind::ScanModels => {
                let params: ScanParams = serde_json::from_value(value).map_err(invalid)?;
                if params.folder.trim().is_empty() {
                    return Err(CoreError::Validation("folder is required".to_string()));
                }
                TaskParams::ScanModels(params)
            }
            TaskKind::UpdateMetadata => {
                let params: MetadataParams = serde_json::from_value(value).map_err(invalid)?;
                if params.model_path.trim().is_empty() {
                    return Err(CoreError::Validation("modelPath is required".to_string()));
                }
                TaskParams::UpdateMetadata(params)
            }
            TaskKind::ScanInformation => {
                let params: ScanInformationParams = serde_json::from_value(value).map_err(invalid)?;
                if params.mode != "diff" && params.mode != "full" {
                    return Err(CoreError::Validation(format!(
                        "mode must be diff or full, got {}",
                        params.mode
                    )));
                }
                TaskParams::ScanInformation(params)
            }
        };
        Ok(params)
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParams::DownloadModel(_) => TaskKind::DownloadModel,
            TaskParams::ScanModels(_) => TaskKind::ScanModels,
            TaskParams::UpdateMetadata(_) => TaskKind::UpdateMetadata,
            TaskParams::ScanInformation(_) => TaskKind::ScanInformation,
        }
    }

    pub fn as_download(&self) -> Option<&DownloadParams> {
        match self {
            TaskParams::DownloadModel(params) => Some(params),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub params: TaskParams,
    pub status: TaskState,
    pub progress: f64,
    pub error: Option<String>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl Task {
    pub fn new(params: TaskParams) -> Self {
        Self::with_id(Uuid::new_v4(), params)
    }

    pub fn with_id(id: TaskId, params: TaskParams) -> Self {
        Self {
            id,
            params,
            status: TaskState::Pending,
            progress: 0.0,
            error: None,
            created_at: now_epoch(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.params.kind()
    }

    pub fn set_progress(&mut self, progress: f64) {
        self.progress = progress.clamp(0.0, 100.0);
    }

    pub fn mark_started(&mut self) {
        self.status = TaskState::Running;
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(now_epoch());
        }
    }

    pub fn mark_finished(&mut self, status: TaskState, error: Option<String>) {
        self.status = status;
        self.error = error;
        if status == TaskState::Completed || status == TaskState::ModelExists {
            self.progress = 100.0;
        }
        self.completed_at = Some(now_epoch());
    }

    /// The public `{id, type, status, progress, error}` view.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "id": self.id.to_string(),
            "type": self.kind().as_str(),
            "status": self.status.as_str(),
            "progress": self.progress,
            "error": self.error,
        })
    }
}

pub(crate) fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
