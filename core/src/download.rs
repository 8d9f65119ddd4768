use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::checksum::{verify_file, ExpectedHash};
use crate::config::ManagerConfig;
use crate::content::{partial_path, TaskContent};
use crate::control::{Signal, TaskControl};
use crate::credentials::CredentialStore;
use crate::error::{CoreError, CoreResult};
use crate::metadata::{preview_target, write_sidecar};
use crate::net::{DownloadRequest, NetClient};
use crate::paths::PathRegistry;
use crate::platform::{is_html_content_type, Platform};

const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadUpdate {
    /// The server reported a size different from the stored one; the
    /// descriptor should be rewritten.
    TotalChanged(u64),
    Progress { downloaded: u64, total: u64, bps: f64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed(PathBuf),
    Paused,
    Cancelled,
}

enum TransferEnd {
    Finished,
    Stopped(Signal),
}

/// Runs one resumable transfer from a descriptor to a placed model file.
pub struct DownloadEngine {
    config: ManagerConfig,
    net: Arc<dyn NetClient>,
    credentials: Arc<CredentialStore>,
    paths: Arc<PathRegistry>,
}

impl DownloadEngine {
    pub fn new(
        config: ManagerConfig,
        net: Arc<dyn NetClient>,
        credentials: Arc<CredentialStore>,
        paths: Arc<PathRegistry>,
    ) -> Self {
        Self {
            config,
            net,
            credentials,
            paths,
        }
    }

    pub fn paths(&self) -> &PathRegistry {
        &self.paths
    }

    pub fn target_path(&self, content: &TaskContent) -> CoreResult<PathBuf> {
        self.paths
            .full_path(&content.category, content.path_index, &content.filename)
    }

    pub fn run(
        &self,
        content: &mut TaskContent,
        control: &TaskControl,
        on_update: &mut dyn FnMut(DownloadUpdate),
    ) -> CoreResult<DownloadOutcome> {
        let target = self.target_path(content)?;
        if target.exists() {
            return Err(CoreError::AlreadyExists(target.display().to_string()));
        }
        fs::create_dir_all(&self.config.download_dir)?;
        let partial = partial_path(&self.config.download_dir, &content.task_id);
        let platform = content.platform.as_deref().and_then(Platform::from_str);
        let token = platform.and_then(|platform| self.credentials.get(platform));

        let mut reported = 0u64;
        let mut attempt = 0u32;
        loop {
            let result = self.transfer(
                content,
                &partial,
                token.as_deref(),
                control,
                &mut |update| {
                    if let DownloadUpdate::Progress { downloaded, .. } = &update {
                        if *downloaded < reported {
                            return;
                        }
                        reported = *downloaded;
                    }
                    on_update(update);
                },
            );
            match result {
                Ok(TransferEnd::Finished) => break,
                Ok(TransferEnd::Stopped(signal)) => return self.stopped(signal, &partial),
                Err(err) if err.is_transient() && attempt < self.config.retry_count => {
                    attempt += 1;
                    tracing::warn!(
                        task_id = %content.task_id,
                        attempt,
                        "transient download failure, resuming: {}",
                        err
                    );
                    let backoff = self.config.retry_backoff * attempt;
                    if let Some(signal) = wait_or_stop(control, backoff) {
                        return self.stopped(signal, &partial);
                    }
                }
                Err(err) => {
                    if matches!(err, CoreError::SizeMismatch { .. }) {
                        discard(&partial);
                    }
                    return Err(err);
                }
            }
        }

        let placed = self.finalize(content, &partial, &target, on_update)?;
        Ok(DownloadOutcome::Completed(placed))
    }

    fn transfer(
        &self,
        content: &mut TaskContent,
        partial: &Path,
        token: Option<&str>,
        control: &TaskControl,
        on_update: &mut dyn FnMut(DownloadUpdate),
    ) -> CoreResult<TransferEnd> {
        let platform_name = content
            .platform
            .clone()
            .unwrap_or_else(|| "this host".to_string());
        loop {
            if control.is_stopped() {
                return Ok(TransferEnd::Stopped(control.signal()));
            }
            let existing = fs::metadata(partial).map(|meta| meta.len()).unwrap_or(0);
            if content.size_bytes > 0 && existing == content.size_bytes {
                tracing::debug!(task_id = %content.task_id, "partial already complete");
                return Ok(TransferEnd::Finished);
            }

            let mut req = DownloadRequest::new(content.url.clone());
            req.bearer_token = token.map(|token| token.to_string());
            if existing > 0 {
                req.range_start = Some(existing);
            }
            let mut resp = self.net.get(&req)?;

            match resp.status_code {
                401 | 403 => {
                    return Err(CoreError::AuthRequired {
                        platform: platform_name,
                        reason: format!("server returned {}", resp.status_code),
                    })
                }
                404 => return Err(CoreError::NotFound(content.url.clone())),
                416 if existing > 0 => {
                    tracing::warn!(
                        task_id = %content.task_id,
                        existing,
                        "range not satisfiable, discarding partial"
                    );
                    discard(partial);
                    continue;
                }
                _ if !resp.is_success() => {
                    return Err(CoreError::Http {
                        status: resp.status_code,
                        url: content.url.clone(),
                    })
                }
                _ => {}
            }
            if is_html_content_type(resp.content_type.as_deref()) {
                return Err(CoreError::AuthRequired {
                    platform: platform_name,
                    reason: "login required".to_string(),
                });
            }

            let resumed = resp.status_code == 206 && existing > 0;
            if existing > 0 && !resumed {
                tracing::info!(task_id = %content.task_id, "server ignored range, restarting from zero");
            }
            let offset = if resumed { existing } else { 0 };
            let server_total = resp
                .range_total
                .or_else(|| resp.content_length.map(|len| offset + len));
            if let Some(total) = server_total {
                if total != content.size_bytes {
                    tracing::info!(
                        task_id = %content.task_id,
                        hinted = content.size_bytes,
                        reported = total,
                        "server size overrides hint"
                    );
                    content.size_bytes = total;
                    on_update(DownloadUpdate::TotalChanged(total));
                }
            }

            let mut file = open_partial(partial, resumed)?;
            return self.stream(&mut resp.body, &mut file, offset, content, control, on_update);
        }
    }

    fn stream(
        &self,
        body: &mut dyn Read,
        file: &mut File,
        offset: u64,
        content: &TaskContent,
        control: &TaskControl,
        on_update: &mut dyn FnMut(DownloadUpdate),
    ) -> CoreResult<TransferEnd> {
        let total = content.size_bytes;
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut downloaded = offset;
        let mut last_emit = Instant::now();
        let mut last_bytes = downloaded;

        loop {
            if control.is_stopped() {
                file.flush()?;
                return Ok(TransferEnd::Stopped(control.signal()));
            }
            let read = match body.read(&mut buf) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    file.flush()?;
                    return Err(CoreError::Network(err.to_string()));
                }
            };
            if read == 0 {
                break;
            }
            file.write_all(&buf[..read])?;
            downloaded += read as u64;
            if total > 0 && downloaded > total {
                return Err(CoreError::SizeMismatch {
                    expected: total,
                    actual: downloaded,
                });
            }
            let elapsed = last_emit.elapsed();
            if elapsed >= self.config.progress_interval {
                let secs = elapsed.as_secs_f64();
                let bps = if secs > 0.0 {
                    (downloaded - last_bytes) as f64 / secs
                } else {
                    0.0
                };
                on_update(DownloadUpdate::Progress {
                    downloaded,
                    total,
                    bps,
                });
                last_emit = Instant::now();
                last_bytes = downloaded;
            }
        }
        file.flush()?;
        on_update(DownloadUpdate::Progress {
            downloaded,
            total,
            bps: 0.0,
        });

        if total > 0 && downloaded < total {
            return Err(CoreError::Network(format!(
                "connection closed after {} of {} bytes",
                downloaded, total
            )));
        }
        Ok(TransferEnd::Finished)
    }

    fn stopped(&self, signal: Signal, partial: &Path) -> CoreResult<DownloadOutcome> {
        match signal {
            Signal::Cancel => {
                discard(partial);
                Ok(DownloadOutcome::Cancelled)
            }
            Signal::Timeout => Err(CoreError::Timeout(self.config.task_timeout.as_secs())),
            Signal::Pause | Signal::None => Ok(DownloadOutcome::Paused),
        }
    }

    fn finalize(
        &self,
        content: &mut TaskContent,
        partial: &Path,
        target: &Path,
        on_update: &mut dyn FnMut(DownloadUpdate),
    ) -> CoreResult<PathBuf> {
        let actual = fs::metadata(partial)?.len();
        if content.size_bytes == 0 {
            content.size_bytes = actual;
            on_update(DownloadUpdate::TotalChanged(actual));
        } else if actual != content.size_bytes {
            discard(partial);
            return Err(CoreError::SizeMismatch {
                expected: content.size_bytes,
                actual,
            });
        }

        if let Some(expected) = ExpectedHash::from_map(&content.hashes) {
            if let Err(err) = verify_file(partial, &expected) {
                discard(partial);
                return Err(err);
            }
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.exists() {
            return Err(CoreError::AlreadyExists(target.display().to_string()));
        }
        place_file(partial, target)?;
        tracing::info!(task_id = %content.task_id, path = %target.display(), "model placed");

        write_sidecar(target, &provenance(content))?;
        if let Some(url) = content.preview_urls.first() {
            if let Err(err) = self.fetch_preview(url, target) {
                tracing::warn!(task_id = %content.task_id, "preview download failed: {}", err);
            }
        }
        Ok(target.to_path_buf())
    }

    fn fetch_preview(&self, url: &str, target: &Path) -> CoreResult<PathBuf> {
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
        let path = preview_target(target, ext)
            .ok_or_else(|| CoreError::Validation(format!("no preview path for {}", target.display())))?;
        let mut data = Vec::new();
        resp.body
            .read_to_end(&mut data)
            .map_err(|err| CoreError::Network(err.to_string()))?;
        fs::write(&path, data)?;
        Ok(path)
    }
}

fn open_partial(path: &Path, append: bool) -> CoreResult<File> {
    let file = if append {
        OpenOptions::new().append(true).open(path)?
    } else {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?
    };
    Ok(file)
}

fn discard(partial: &Path) {
    match fs::remove_file(partial) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %partial.display(), "cannot remove partial: {}", err),
    }
}

/// Sleeps for `duration` unless the task is signalled first.
fn wait_or_stop(control: &TaskControl, duration: Duration) -> Option<Signal> {
    let deadline = Instant::now() + duration;
    loop {
        if control.is_stopped() {
            return Some(control.signal());
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
}

/// Rename, falling back to copy + remove across filesystems.
pub fn place_file(from: &Path, to: &Path) -> CoreResult<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|err| {
        CoreError::Io(format!(
            "cannot move {} to {}: {}",
            from.display(),
            to.display(),
            err
        ))
    })?;
    if let Err(err) = fs::remove_file(from) {
        tracing::warn!(path = %from.display(), "copied partial left behind: {}", err);
    }
    Ok(())
}

fn provenance(content: &TaskContent) -> Map<String, Value> {
    let mut sidecar = Map::new();
    sidecar.insert("name".to_string(), Value::from(content.filename.clone()));
    sidecar.insert("type".to_string(), Value::from(content.category.clone()));
    sidecar.insert(
        "platform".to_string(),
        content
            .platform
            .clone()
            .map(Value::from)
            .unwrap_or(Value::Null),
    );
    sidecar.insert("downloadUrl".to_string(), Value::from(content.url.clone()));
    sidecar.insert(
        "hashes".to_string(),
        serde_json::to_value(&content.hashes).unwrap_or(Value::Null),
    );
    sidecar.insert(
        "description".to_string(),
        Value::from(content.description.clone().unwrap_or_default()),
    );
    sidecar.insert(
        "triggerWords".to_string(),
        Value::from(content.trigger_words.clone()),
    );
    sidecar.insert(
        "previewUrls".to_string(),
        Value::from(content.preview_urls.clone()),
    );
    sidecar.insert("sizeBytes".to_string(), Value::from(content.size_bytes));
    sidecar
}

pub(crate) fn preview_extension(content_type: Option<&str>, url: &str) -> &'static str {
    let content_type = content_type.unwrap_or("").to_ascii_lowercase();
    if content_type.contains("jpeg") || content_type.contains("jpg") {
        return "jpeg";
    }
    if content_type.contains("webp") {
        return "webp";
    }
    if content_type.contains("png") {
        return "png";
    }
    let path = url::Url::parse(url)
        .map(|parsed| parsed.path().to_ascii_lowercase())
        .unwrap_or_default();
    if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "jpeg"
    } else if path.ends_with(".webp") {
        "webp"
    } else {
        "png"
    }
}
