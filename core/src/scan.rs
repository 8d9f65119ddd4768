use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use walkdir::WalkDir;

use crate::checksum::sha256_file;
use crate::config::ManagerConfig;
use crate::control::{Signal, TaskControl};
use crate::error::{CoreError, CoreResult};
use crate::events::{Broadcaster, EventKind};
use crate::metadata::{find_preview, read_sidecar};
use crate::paths::{extension_of, PathRegistry};
use crate::task::now_millis;

/// One deduplicated model file. `hash` is the identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub hash: String,
    pub path: String,
    pub path_index: usize,
    pub sub_folder: String,
    pub filename: String,
    pub basename: String,
    pub extension: String,
    pub size: u64,
    pub modified: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSnapshot {
    pub folder: String,
    pub records: Vec<ModelRecord>,
    pub is_scanning: bool,
}

impl ScanSnapshot {
    pub fn to_json(&self) -> Value {
        json!({
            "folder": self.folder,
            "records": self.records,
            "is_scanning": self.is_scanning,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    scan_cache: BTreeMap<String, Vec<ModelRecord>>,
    /// Folder -> scan completion time in epoch milliseconds.
    #[serde(default)]
    scan_times: BTreeMap<String, u64>,
}

#[derive(Default)]
struct ScanState {
    cache: CacheFile,
    scanning: HashSet<String>,
    handles: Vec<JoinHandle<()>>,
}

struct ScanInner {
    config: ManagerConfig,
    paths: Arc<PathRegistry>,
    broadcaster: Arc<Broadcaster>,
    state: Mutex<ScanState>,
    finished: Condvar,
    walks: AtomicU64,
}

impl ScanInner {
    fn lock(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-folder scan results with a TTL, persisted to the scan cache file.
#[derive(Clone)]
pub struct ScanCache {
    inner: Arc<ScanInner>,
}

impl ScanCache {
    pub fn new(config: ManagerConfig, paths: Arc<PathRegistry>, broadcaster: Arc<Broadcaster>) -> Self {
        let cache = load_cache(&config.scan_cache_file());
        Self {
            inner: Arc::new(ScanInner {
                config,
                paths,
                broadcaster,
                state: Mutex::new(ScanState {
                    cache,
                    ..ScanState::default()
                }),
                finished: Condvar::new(),
                walks: AtomicU64::new(0),
            }),
        }
    }

    /// Fresh results come straight from the cache. Otherwise a background
    /// rescan starts (unless one is running) and the previous snapshot is
    /// returned with `is_scanning` set.
    pub fn request(&self, folder: &str) -> CoreResult<ScanSnapshot> {
        self.inner.paths.get(folder)?;
        let mut state = self.inner.lock();
        let scanning = state.scanning.contains(folder);
        let records = state.cache.scan_cache.get(folder).cloned();
        if let Some(records) = records.clone() {
            if !scanning && self.is_fresh(&state, folder) {
                return Ok(ScanSnapshot {
                    folder: folder.to_string(),
                    records,
                    is_scanning: false,
                });
            }
        }
        if !scanning {
            state.scanning.insert(folder.to_string());
            state.handles.retain(|handle| !handle.is_finished());
            let inner = Arc::clone(&self.inner);
            let name = folder.to_string();
            let include_hidden = self.inner.config.include_hidden_files;
            let spawned = thread::Builder::new()
                .name(format!("modelhub-scan-{}", folder))
                .spawn(move || {
                    let control = TaskControl::new();
                    let result =
                        walk_folder(&inner, &name, include_hidden, &control, &mut |_, _| {});
                    finish_scan(&inner, &name, &result);
                });
            match spawned {
                Ok(handle) => state.handles.push(handle),
                Err(err) => {
                    state.scanning.remove(folder);
                    return Err(CoreError::Io(format!("cannot start scan: {}", err)));
                }
            }
            tracing::debug!(folder, "background scan started");
        }
        Ok(ScanSnapshot {
            folder: folder.to_string(),
            records: records.unwrap_or_default(),
            is_scanning: true,
        })
    }

    /// Scans synchronously, waiting out any scan already running for the
    /// folder. `progress` receives `(processed, total)` candidate files.
    /// `control` is checked before each file; a stopped scan leaves the
    /// cached records untouched.
    pub fn scan_now(
        &self,
        folder: &str,
        include_hidden: Option<bool>,
        control: &TaskControl,
        progress: &mut dyn FnMut(usize, usize),
    ) -> CoreResult<Vec<ModelRecord>> {
        self.inner.paths.get(folder)?;
        {
            let mut state = self.inner.lock();
            while state.scanning.contains(folder) {
                state = self
                    .inner
                    .finished
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.scanning.insert(folder.to_string());
        }
        let include_hidden = include_hidden.unwrap_or(self.inner.config.include_hidden_files);
        let result = walk_folder(&self.inner, folder, include_hidden, control, progress);
        finish_scan(&self.inner, folder, &result);
        result
    }

    /// Marks the folder stale; the cached records stay as the prior snapshot.
    pub fn invalidate(&self, folder: &str) {
        let mut state = self.inner.lock();
        if state.cache.scan_times.remove(folder).is_some() {
            save_cache(&self.inner.config.scan_cache_file(), &state.cache);
        }
    }

    /// Waits for every running scan. Returns false on timeout.
    pub fn wait_for_scans(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        while !state.scanning.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .finished
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Number of filesystem walks performed since construction.
    pub fn walk_count(&self) -> u64 {
        self.inner.walks.load(Ordering::SeqCst)
    }

    fn is_fresh(&self, state: &ScanState, folder: &str) -> bool {
        let ttl = self.inner.config.scan_cache_ttl.as_millis() as u64;
        match state.cache.scan_times.get(folder) {
            Some(scanned_at) => now_millis().saturating_sub(*scanned_at) < ttl,
            None => false,
        }
    }
}

fn finish_scan(inner: &ScanInner, folder: &str, result: &CoreResult<Vec<ModelRecord>>) {
    let mut state = inner.lock();
    match result {
        Ok(records) => {
            let count = records.len();
            state.cache.scan_cache.insert(folder.to_string(), records.clone());
            state
                .cache
                .scan_times
                .insert(folder.to_string(), now_millis());
            save_cache(&inner.config.scan_cache_file(), &state.cache);
            state.scanning.remove(folder);
            drop(state);
            tracing::info!(folder, count, "scan complete");
            inner
                .broadcaster
                .broadcast(EventKind::ScanComplete, json!({"folder": folder, "count": count}));
        }
        Err(CoreError::Cancelled) => {
            state.scanning.remove(folder);
            drop(state);
            tracing::info!(folder, "scan cancelled");
        }
        Err(err) => {
            state.scanning.remove(folder);
            drop(state);
            tracing::error!(folder, "scan failed: {}", err);
            inner.broadcaster.broadcast(
                EventKind::ScanError,
                json!({"folder": folder, "error": err.to_string()}),
            );
        }
    }
    inner.finished.notify_all();
}

fn walk_folder(
    inner: &ScanInner,
    folder: &str,
    include_hidden: bool,
    control: &TaskControl,
    progress: &mut dyn FnMut(usize, usize),
) -> CoreResult<Vec<ModelRecord>> {
    inner.walks.fetch_add(1, Ordering::SeqCst);
    let category = inner.paths.get(folder)?;

    let mut candidates: Vec<(usize, PathBuf, PathBuf)> = Vec::new();
    for (path_index, root) in category.roots.iter().enumerate() {
        if !root.is_dir() {
            tracing::warn!(folder, root = %root.display(), "model root does not exist");
            continue;
        }
        let walker = WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                include_hidden
                    || entry.depth() == 0
                    || !entry.file_name().to_string_lossy().starts_with('.')
            });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(folder, "skipping unreadable entry: {}", err);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !inner.paths.accepts(folder, &name) {
                continue;
            }
            candidates.push((path_index, root.clone(), entry.into_path()));
        }
    }

    let total = candidates.len();
    let mut records: Vec<ModelRecord> = Vec::new();
    let mut by_hash: HashMap<String, usize> = HashMap::new();
    for (processed, (path_index, root, path)) in candidates.into_iter().enumerate() {
        match control.signal() {
            Signal::None => {}
            Signal::Timeout => {
                return Err(CoreError::Timeout(inner.config.task_timeout.as_secs()))
            }
            Signal::Pause | Signal::Cancel => return Err(CoreError::Cancelled),
        }
        let record = match build_record(path_index, &root, &path) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(path = %path.display(), "skipping model: {}", err);
                progress(processed + 1, total);
                continue;
            }
        };
        let accepted = match by_hash.get(&record.hash) {
            Some(&index) => {
                if should_replace(&inner.paths, &records[index], &record) {
                    tracing::debug!(kept = %record.path, dropped = %records[index].path, "duplicate replaced");
                    records[index] = record.clone();
                    true
                } else {
                    tracing::debug!(kept = %records[index].path, dropped = %record.path, "duplicate skipped");
                    false
                }
            }
            None => {
                by_hash.insert(record.hash.clone(), records.len());
                records.push(record.clone());
                true
            }
        };
        if accepted {
            inner
                .broadcaster
                .broadcast(EventKind::ModelFound, json!({"folder": folder, "model": record}));
        }
        progress(processed + 1, total);
    }

    records.sort_by(|a, b| {
        a.sub_folder
            .cmp(&b.sub_folder)
            .then_with(|| a.filename.cmp(&b.filename))
    });
    Ok(records)
}

fn build_record(path_index: usize, root: &Path, path: &Path) -> CoreResult<ModelRecord> {
    let meta = fs::metadata(path)?;
    let hash = sha256_file(path)?;
    let relative = path.strip_prefix(root).unwrap_or(path);
    let sub_folder = relative
        .parent()
        .map(|parent| parent.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let basename = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let modified = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let preview = find_preview(path).and_then(|preview| {
        preview
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
    });
    Ok(ModelRecord {
        hash,
        path: path.to_string_lossy().to_string(),
        path_index,
        sub_folder,
        extension: extension_of(&filename).unwrap_or_default(),
        filename,
        basename,
        size: meta.len(),
        modified,
        metadata: read_sidecar(path).unwrap_or_default(),
        preview,
    })
}

/// Priority between two byte-identical files: conventional location, then
/// more sidecar keys, then a preview. On a full tie the existing record
/// stays.
fn should_replace(paths: &PathRegistry, existing: &ModelRecord, candidate: &ModelRecord) -> bool {
    let existing_std = paths.is_conventional_location(Path::new(&existing.path));
    let candidate_std = paths.is_conventional_location(Path::new(&candidate.path));
    if existing_std != candidate_std {
        return candidate_std;
    }
    if existing.metadata.len() != candidate.metadata.len() {
        return candidate.metadata.len() > existing.metadata.len();
    }
    if existing.preview.is_some() != candidate.preview.is_some() {
        return candidate.preview.is_some();
    }
    false
}

fn load_cache(path: &Path) -> CacheFile {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(_) => return CacheFile::default(),
    };
    match serde_json::from_slice::<CacheFile>(&data) {
        Ok(cache) => {
            tracing::info!(folders = cache.scan_cache.len(), "loaded scan cache");
            cache
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring corrupt scan cache: {}", err);
            CacheFile::default()
        }
    }
}

fn save_cache(path: &Path, cache: &CacheFile) {
    let write = || -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(cache)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    };
    if let Err(err) = write() {
        tracing::error!(path = %path.display(), "cannot save scan cache: {}", err);
    }
}
