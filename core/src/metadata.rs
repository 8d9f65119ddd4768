use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde_json::{Map, Value};

use crate::checksum::sha256_file_with_progress;
use crate::error::{CoreError, CoreResult};

pub const PREVIEW_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// `<model file>.info`, e.g. `a.safetensors.info`.
pub fn sidecar_path(model_path: &Path) -> PathBuf {
    let mut name = OsString::from(model_path.as_os_str());
    name.push(".info");
    PathBuf::from(name)
}

/// Older layout that replaced the extension: `a.info`.
pub fn legacy_sidecar_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("info")
}

pub fn has_sidecar(model_path: &Path) -> bool {
    sidecar_path(model_path).is_file() || legacy_sidecar_path(model_path).is_file()
}

/// The sidecar as a JSON object. Missing, unreadable and non-object sidecars
/// all read as `None`.
pub fn read_sidecar(model_path: &Path) -> Option<Map<String, Value>> {
    for path in [sidecar_path(model_path), legacy_sidecar_path(model_path)] {
        let Ok(data) = fs::read(&path) else {
            continue;
        };
        match serde_json::from_slice::<Value>(&data) {
            Ok(Value::Object(map)) => return Some(map),
            Ok(_) => tracing::warn!(path = %path.display(), "sidecar is not a JSON object"),
            Err(err) => tracing::warn!(path = %path.display(), "unreadable sidecar: {}", err),
        }
    }
    None
}

pub fn write_sidecar(model_path: &Path, metadata: &Map<String, Value>) -> CoreResult<PathBuf> {
    let path = sidecar_path(model_path);
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, serde_json::to_vec_pretty(metadata)?)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

fn stem_of(model_path: &Path) -> Option<String> {
    model_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
}

/// Every preview image next to the model: `<stem>.preview.*` first, then
/// `<stem>.{png,jpg,jpeg,webp}`.
pub fn preview_files(model_path: &Path) -> Vec<PathBuf> {
    let (Some(dir), Some(stem)) = (model_path.parent(), stem_of(model_path)) else {
        return Vec::new();
    };
    let prefix = format!("{}.preview.", stem);
    let mut found: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .map(|name| name.to_string_lossy().starts_with(&prefix))
                        .unwrap_or(false)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    found.sort();
    for ext in PREVIEW_EXTENSIONS {
        let candidate = dir.join(format!("{}.{}", stem, ext));
        if candidate.is_file() {
            found.push(candidate);
        }
    }
    found
}

pub fn find_preview(model_path: &Path) -> Option<PathBuf> {
    preview_files(model_path).into_iter().next()
}

/// Where a freshly downloaded preview goes, given the image's extension.
pub fn preview_target(model_path: &Path, ext: &str) -> Option<PathBuf> {
    let dir = model_path.parent()?;
    let stem = stem_of(model_path)?;
    Some(dir.join(format!("{}.preview.{}", stem, ext)))
}

/// Removes a model file together with its sidecars and previews.
pub fn remove_model_artifacts(model_path: &Path) -> CoreResult<()> {
    let mut targets = vec![
        model_path.to_path_buf(),
        sidecar_path(model_path),
        legacy_sidecar_path(model_path),
    ];
    targets.extend(preview_files(model_path));
    for target in targets {
        match fs::remove_file(&target) {
            Ok(()) => tracing::debug!(path = %target.display(), "removed stale model artifact"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(CoreError::Io(format!(
                    "cannot remove {}: {}",
                    target.display(),
                    err
                )))
            }
        }
    }
    Ok(())
}

/// Hashes the model and merges the file facts into its sidecar. Keys the
/// sidecar already carries (description, hashes from a hub, ...) are kept.
pub fn update_metadata<F>(model_path: &Path, mut progress: F) -> CoreResult<Value>
where
    F: FnMut(f64),
{
    let meta = fs::metadata(model_path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => {
            CoreError::NotFound(format!("model file {}", model_path.display()))
        }
        _ => CoreError::from(err),
    })?;
    if !meta.is_file() {
        return Err(CoreError::Validation(format!(
            "{} is not a file",
            model_path.display()
        )));
    }

    let sha256 = sha256_file_with_progress(model_path, |hashed, total| {
        if total > 0 {
            progress(hashed as f64 / total as f64 * 95.0);
        }
    })?;

    let modified = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let category = model_path
        .parent()
        .and_then(|dir| dir.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut sidecar = read_sidecar(model_path).unwrap_or_default();
    let name = model_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    sidecar.insert("name".to_string(), Value::from(name));
    sidecar.insert(
        "path".to_string(),
        Value::from(model_path.to_string_lossy().to_string()),
    );
    sidecar.insert("size".to_string(), Value::from(meta.len()));
    sidecar.insert("type".to_string(), Value::from(category));
    sidecar.insert("modified".to_string(), Value::from(modified));
    sidecar.insert("sha256".to_string(), Value::from(sha256));
    let written = write_sidecar(model_path, &sidecar)?;
    progress(100.0);

    Ok(serde_json::json!({
        "file": written.to_string_lossy(),
        "metadata": Value::Object(sidecar),
    }))
}
