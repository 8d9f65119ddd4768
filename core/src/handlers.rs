use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::content::{recompute, TaskContent, TaskStatus};
use crate::control::TaskControl;
use crate::download::{DownloadEngine, DownloadOutcome, DownloadUpdate};
use crate::error::{CoreError, CoreResult};
use crate::metadata::{has_sidecar, remove_model_artifacts, update_metadata};
use crate::scan::ScanCache;
use crate::task::{Task, TaskId, TaskParams, TaskState};

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Completed(Value),
    Paused,
    Cancelled,
    ModelExists(Value),
}

/// What a running handler may touch in the manager.
pub trait TaskHost: Send + Sync {
    fn report_progress(&self, id: &TaskId, percent: f64);
    fn load_content(&self, id: &TaskId) -> CoreResult<TaskContent>;
    fn save_content(&self, content: &TaskContent) -> CoreResult<()>;
    fn publish_status(&self, status: TaskStatus);
}

pub struct TaskContext<'a> {
    pub control: &'a TaskControl,
    pub host: &'a dyn TaskHost,
}

pub trait TaskHandler: Send + Sync {
    /// Settles a task before it reaches the pool, without network access.
    fn precheck(&self, _task: &Task, _host: &dyn TaskHost) -> CoreResult<Option<HandlerOutcome>> {
        Ok(None)
    }

    fn run(&self, task: &Task, ctx: &TaskContext<'_>) -> CoreResult<HandlerOutcome>;
}

pub struct DownloadHandler {
    engine: Arc<DownloadEngine>,
    scan: ScanCache,
    download_dir: PathBuf,
    size_tolerance: u64,
}

impl DownloadHandler {
    /// A placed model marks its category stale in `scan`.
    pub fn new(
        engine: Arc<DownloadEngine>,
        scan: ScanCache,
        download_dir: impl Into<PathBuf>,
        size_tolerance: u64,
    ) -> Self {
        Self {
            engine,
            scan,
            download_dir: download_dir.into(),
            size_tolerance,
        }
    }
}

impl TaskHandler for DownloadHandler {
    /// A target that already exists with a plausible size and a sidecar
    /// settles as MODEL_EXISTS. Anything else at the target is stale and is
    /// removed along with its sidecar and previews.
    fn precheck(&self, task: &Task, host: &dyn TaskHost) -> CoreResult<Option<HandlerOutcome>> {
        let content = host.load_content(&task.id)?;
        let target = self.engine.target_path(&content)?;
        let Ok(meta) = target.metadata() else {
            return Ok(None);
        };
        let local = meta.len();
        let size_ok = content.size_bytes == 0 || local.abs_diff(content.size_bytes) <= self.size_tolerance;
        if size_ok && has_sidecar(&target) {
            tracing::info!(task_id = %task.id, path = %target.display(), "model already present");
            return Ok(Some(HandlerOutcome::ModelExists(json!({
                "path": target.to_string_lossy(),
                "size": local,
            }))));
        }
        tracing::info!(
            task_id = %task.id,
            path = %target.display(),
            local,
            expected = content.size_bytes,
            "removing stale model before download"
        );
        remove_model_artifacts(&target)?;
        Ok(None)
    }

    fn run(&self, task: &Task, ctx: &TaskContext<'_>) -> CoreResult<HandlerOutcome> {
        let mut content = ctx.host.load_content(&task.id)?;
        let mut persisted = content.clone();
        let mut status = recompute(&content, &self.download_dir);
        status.state = TaskState::Running;
        ctx.host.publish_status(status.clone());

        let outcome = self.engine.run(&mut content, ctx.control, &mut |update| match update {
            DownloadUpdate::TotalChanged(total) => {
                persisted.size_bytes = total;
                if let Err(err) = ctx.host.save_content(&persisted) {
                    tracing::warn!(task_id = %task.id, "cannot rewrite descriptor: {}", err);
                }
                let downloaded = status.downloaded_size.min(total);
                status.set_bytes(downloaded, total);
                ctx.host.publish_status(status.clone());
            }
            DownloadUpdate::Progress {
                downloaded,
                total,
                bps,
            } => {
                status.set_bytes(downloaded, total);
                status.bps = bps;
                ctx.host.report_progress(&task.id, status.progress);
                ctx.host.publish_status(status.clone());
            }
        })?;

        Ok(match outcome {
            DownloadOutcome::Completed(path) => {
                self.scan.invalidate(&content.category);
                HandlerOutcome::Completed(json!({
                    "path": path.to_string_lossy(),
                    "size": content.size_bytes,
                }))
            }
            DownloadOutcome::Paused => HandlerOutcome::Paused,
            DownloadOutcome::Cancelled => HandlerOutcome::Cancelled,
        })
    }
}

pub struct ScanHandler {
    scan: ScanCache,
}

impl ScanHandler {
    pub fn new(scan: ScanCache) -> Self {
        Self { scan }
    }
}

impl TaskHandler for ScanHandler {
    fn run(&self, task: &Task, ctx: &TaskContext<'_>) -> CoreResult<HandlerOutcome> {
        let TaskParams::ScanModels(params) = &task.params else {
            return Err(CoreError::Validation("scan handler got a non-scan task".to_string()));
        };
        let result = self.scan.scan_now(
            &params.folder,
            params.include_hidden,
            ctx.control,
            &mut |done, total| {
                if total > 0 {
                    ctx.host
                        .report_progress(&task.id, done as f64 / total as f64 * 100.0);
                }
            },
        );
        let records = match result {
            Ok(records) => records,
            Err(CoreError::Cancelled) => return Ok(HandlerOutcome::Cancelled),
            Err(err) => return Err(err),
        };
        Ok(HandlerOutcome::Completed(json!({
            "folder": params.folder,
            "count": records.len(),
            "records": records,
        })))
    }
}

pub struct MetadataHandler;

impl TaskHandler for MetadataHandler {
    fn run(&self, task: &Task, ctx: &TaskContext<'_>) -> CoreResult<HandlerOutcome> {
        let TaskParams::UpdateMetadata(params) = &task.params else {
            return Err(CoreError::Validation(
                "metadata handler got a non-metadata task".to_string(),
            ));
        };
        let result = update_metadata(Path::new(&params.model_path), |percent| {
            ctx.host.report_progress(&task.id, percent)
        })?;
        Ok(HandlerOutcome::Completed(result))
    }
}
