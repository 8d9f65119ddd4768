use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use walkdir::WalkDir;

use crate::checksum::sha256_file;
use crate::control::Signal;
use crate::credentials::CredentialStore;
use crate::download::preview_extension;
use crate::error::{CoreError, CoreResult};
use crate::handlers::{HandlerOutcome, TaskContext, TaskHandler};
use crate::metadata::{has_sidecar, preview_target, read_sidecar, write_sidecar};
use crate::net::{DownloadRequest, NetClient};
use crate::paths::PathRegistry;
use crate::platform::{is_html_content_type, Platform};
use crate::task::{Task, TaskParams};

pub const CIVITAI_BY_HASH_URL: &str = "https://civitai.com/api/v1/model-versions/by-hash/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformationMode {
    /// Only models without a sidecar.
    Diff,
    /// Every model, overwriting hub fields in existing sidecars.
    Full,
}

impl InformationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InformationMode::Diff => "diff",
            InformationMode::Full => "full",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "diff" => Some(InformationMode::Diff),
            "full" => Some(InformationMode::Full),
            _ => None,
        }
    }
}

/// Looks every model up on Civitai by its SHA-256 and refreshes its sidecar
/// and preview. A model that fails is recorded in the result; the task
/// still completes.
pub struct InformationHandler {
    net: Arc<dyn NetClient>,
    paths: Arc<PathRegistry>,
    credentials: Arc<CredentialStore>,
    task_timeout: Duration,
}

impl InformationHandler {
    pub fn new(
        net: Arc<dyn NetClient>,
        paths: Arc<PathRegistry>,
        credentials: Arc<CredentialStore>,
        task_timeout: Duration,
    ) -> Self {
        Self {
            net,
            paths,
            credentials,
            task_timeout,
        }
    }

    /// `path` is a category name, a model file, or absent for every
    /// registered category.
    fn model_files(&self, path: Option<&str>) -> CoreResult<Vec<PathBuf>> {
        let categories: Vec<&str> = match path {
            None => self.paths.category_names().collect(),
            Some(name) if self.paths.contains(name) => vec![name],
            Some(file) => {
                let file = Path::new(file);
                if !file.is_file() {
                    return Err(CoreError::NotFound(format!("model path {}", file.display())));
                }
                return Ok(vec![file.to_path_buf()]);
            }
        };

        let mut files = BTreeSet::new();
        for category in categories {
            for root in &self.paths.get(category)?.roots {
                if !root.is_dir() {
                    continue;
                }
                let walker = WalkDir::new(root)
                    .follow_links(true)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_entry(|entry| {
                        entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
                    });
                for entry in walker.filter_map(|entry| entry.ok()) {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if entry.file_type().is_file() && self.paths.accepts(category, &name) {
                        files.insert(entry.into_path());
                    }
                }
            }
        }
        Ok(files.into_iter().collect())
    }

    fn update_model(&self, model: &Path) -> CoreResult<Vec<String>> {
        let sha256 = sha256_file(model)?;
        let version = self.lookup(&sha256)?;

        let mut sidecar = read_sidecar(model).unwrap_or_default();
        sidecar.extend(sidecar_fields(&version, &sha256));
        write_sidecar(model, &sidecar)?;

        let mut warnings = Vec::new();
        let preview = version
            .get("images")
            .and_then(Value::as_array)
            .and_then(|images| images.iter().find_map(|image| image["url"].as_str()));
        if let Some(url) = preview {
            if let Err(err) = self.fetch_preview(url, model) {
                tracing::warn!(path = %model.display(), "preview download failed: {}", err);
                warnings.push(format!("preview: {}", err));
            }
        }
        Ok(warnings)
    }

    fn lookup(&self, sha256: &str) -> CoreResult<Map<String, Value>> {
        let url = format!("{}{}", CIVITAI_BY_HASH_URL, sha256);
        let mut req = DownloadRequest::new(url.clone());
        req.bearer_token = self.credentials.get(Platform::Civitai);
        let mut resp = self.net.get(&req)?;
        if !resp.is_success() {
            return Err(CoreError::Http {
                status: resp.status_code,
                url,
            });
        }
        let mut body = Vec::new();
        resp.body
            .read_to_end(&mut body)
            .map_err(|err| CoreError::Network(err.to_string()))?;
        match serde_json::from_slice::<Value>(&body)? {
            Value::Object(version) => Ok(version),
            _ => Err(CoreError::Validation(format!("unexpected response from {}", url))),
        }
    }

    fn fetch_preview(&self, url: &str, model: &Path) -> CoreResult<PathBuf> {
        let mut resp = self.net.get(&DownloadRequest::new(url))?;
        if !resp.is_success() {
            return Err(CoreError::Http {
                status: resp.status_code,
                url: url.to_string(),
            });
        }
        if is_html_content_type(resp.content_type.as_deref()) {
            return Err(CoreError::Validation(format!("{} is not an image", url)));
        }
        let ext = preview_extension(resp.content_type.as_deref(), url);
        let target = preview_target(model, ext)
            .ok_or_else(|| CoreError::Validation(format!("no preview path for {}", model.display())))?;
        let mut data = Vec::new();
        resp.body
            .read_to_end(&mut data)
            .map_err(|err| CoreError::Network(err.to_string()))?;
        fs::write(&target, data)?;
        Ok(target)
    }
}

impl TaskHandler for InformationHandler {
    fn run(&self, task: &Task, ctx: &TaskContext<'_>) -> CoreResult<HandlerOutcome> {
        let TaskParams::ScanInformation(params) = &task.params else {
            return Err(CoreError::Validation(
                "information handler got a non-information task".to_string(),
            ));
        };
        let mode = InformationMode::from_str(&params.mode)
            .ok_or_else(|| CoreError::Validation(format!("unknown scan mode {}", params.mode)))?;
        let models = self.model_files(params.path.as_deref())?;
        let total = models.len();
        tracing::info!(task_id = %task.id, mode = mode.as_str(), total, "looking up model information");

        let mut updated = 0usize;
        let mut skipped = 0usize;
        let mut errors: Vec<Value> = Vec::new();
        for (index, model) in models.iter().enumerate() {
            match ctx.control.signal() {
                Signal::None => {}
                Signal::Timeout => return Err(CoreError::Timeout(self.task_timeout.as_secs())),
                Signal::Pause | Signal::Cancel => return Ok(HandlerOutcome::Cancelled),
            }
            if mode == InformationMode::Diff && has_sidecar(model) {
                skipped += 1;
            } else {
                match self.update_model(model) {
                    Ok(warnings) => {
                        updated += 1;
                        for warning in warnings {
                            errors.push(json!({"path": model.to_string_lossy(), "error": warning}));
                        }
                    }
                    Err(err) => {
                        tracing::warn!(path = %model.display(), "model information failed: {}", err);
                        errors.push(json!({"path": model.to_string_lossy(), "error": err.to_string()}));
                    }
                }
            }
            ctx.host
                .report_progress(&task.id, (index + 1) as f64 / total as f64 * 100.0);
        }

        Ok(HandlerOutcome::Completed(json!({
            "mode": mode.as_str(),
            "count": total,
            "updated": updated,
            "skipped": skipped,
            "errors": errors,
        })))
    }
}

/// Hub fields written into the sidecar from a model-version response.
fn sidecar_fields(version: &Map<String, Value>, sha256: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("source".to_string(), json!("civitai"));
    fields.insert("sha256".to_string(), json!(sha256));
    let copy = [
        ("modelId", "modelId"),
        ("id", "versionId"),
        ("name", "versionName"),
        ("baseModel", "baseModel"),
        ("trainedWords", "trainedWords"),
        ("downloadUrl", "downloadUrl"),
    ];
    for (from, to) in copy {
        if let Some(value) = version.get(from).filter(|value| !value.is_null()) {
            fields.insert(to.to_string(), value.clone());
        }
    }
    let model = &version.get("model").cloned().unwrap_or(Value::Null);
    if let Some(name) = model["name"].as_str() {
        fields.insert("name".to_string(), json!(name));
    }
    if let Some(kind) = model["type"].as_str() {
        fields.insert("type".to_string(), json!(kind));
    }
    let description = version
        .get("description")
        .and_then(Value::as_str)
        .or_else(|| model["description"].as_str());
    if let Some(description) = description {
        fields.insert("description".to_string(), json!(description));
    }
    fields
}
