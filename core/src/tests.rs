use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::checksum::sha256_file;
use crate::config::ManagerConfig;
use crate::content::{descriptor_path, partial_path};
use crate::control::TaskControl;
use crate::error::{CoreError, CoreResult};
use crate::events::{Broadcaster, Event, EventKind};
use crate::handlers::{HandlerOutcome, TaskContext, TaskHandler};
use crate::information::CIVITAI_BY_HASH_URL;
use crate::manager::TaskManager;
use crate::metadata::{preview_target, read_sidecar, sidecar_path};
use crate::net::{DownloadRequest, NetClient, NetResponse};
use crate::paths::PathRegistry;
use crate::storage::{MemoryStorage, Storage};
use crate::task::{Task, TaskId, TaskKind, TaskState};

const WAIT: Duration = Duration::from_secs(20);

#[derive(Clone)]
struct Served {
    body: Vec<u8>,
    status: u16,
    content_type: Option<String>,
}

/// Range-aware in-memory server. Reads hand out `step` bytes at a time with
/// an optional pause between them so tests can catch a transfer mid-flight.
#[derive(Default)]
struct FakeNet {
    files: Mutex<HashMap<String, Served>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<DownloadRequest>>,
    fail_next: Mutex<VecDeque<u16>>,
    stall_next: Mutex<VecDeque<usize>>,
    step: usize,
    delay: Duration,
}

impl FakeNet {
    fn new() -> Self {
        Self {
            step: 4096,
            ..Self::default()
        }
    }

    fn slow() -> Self {
        Self {
            step: 1024,
            delay: Duration::from_millis(5),
            ..Self::default()
        }
    }

    fn serve(&self, url: &str, body: Vec<u8>) {
        self.serve_with(url, body, 200, Some("application/octet-stream"));
    }

    fn serve_with(&self, url: &str, body: Vec<u8>, status: u16, content_type: Option<&str>) {
        self.files.lock().unwrap().insert(
            url.to_string(),
            Served {
                body,
                status,
                content_type: content_type.map(str::to_string),
            },
        );
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The next requests, whatever their URL, answer with these statuses.
    fn fail_next(&self, statuses: &[u16]) {
        self.fail_next.lock().unwrap().extend(statuses);
    }

    /// The next body served times out after `bytes`.
    fn stall_next_after(&self, bytes: usize) {
        self.stall_next.lock().unwrap().push_back(bytes);
    }

    fn ranges(&self, url: &str) -> Vec<Option<u64>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.url == url)
            .map(|req| req.range_start)
            .collect()
    }

    fn tokens(&self, url_prefix: &str) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.url.starts_with(url_prefix))
            .map(|req| req.bearer_token.clone())
            .collect()
    }
}

struct SlowReader {
    data: Vec<u8>,
    pos: usize,
    step: usize,
    delay: Duration,
    stall_at: Option<usize>,
}

impl Read for SlowReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let end = self
            .stall_at
            .map_or(self.data.len(), |at| at.min(self.data.len()));
        if self.pos >= end {
            if end < self.data.len() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
            }
            return Ok(0);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let n = self.step.min(buf.len()).min(end - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl NetClient for FakeNet {
    fn get(&self, req: &DownloadRequest) -> CoreResult<NetResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(req.clone());
        if let Some(status) = self.fail_next.lock().unwrap().pop_front() {
            return Ok(empty_response(status));
        }
        let served = self.files.lock().unwrap().get(&req.url).cloned();
        let Some(served) = served else {
            return Ok(empty_response(404));
        };
        if served.status != 200 {
            return Ok(empty_response(served.status));
        }
        let len = served.body.len() as u64;
        let start = req.range_start.unwrap_or(0);
        if start >= len && start > 0 {
            return Ok(empty_response(416));
        }
        let body = served.body[start as usize..].to_vec();
        Ok(NetResponse {
            status_code: if start > 0 { 206 } else { 200 },
            content_length: Some(body.len() as u64),
            content_type: served.content_type.clone(),
            range_total: if start > 0 { Some(len) } else { None },
            body: Box::new(SlowReader {
                data: body,
                pos: 0,
                step: self.step,
                delay: self.delay,
                stall_at: self.stall_next.lock().unwrap().pop_front(),
            }),
        })
    }
}

fn empty_response(status: u16) -> NetResponse {
    NetResponse {
        status_code: status,
        content_length: None,
        content_type: None,
        range_total: None,
        body: Box::new(io::empty()),
    }
}

struct Harness {
    manager: TaskManager,
    events: Receiver<Event>,
    config: ManagerConfig,
    models: PathBuf,
    net: Arc<FakeNet>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(net: FakeNet) -> Self {
        Self::with(net, |_| {}, None)
    }

    fn with(
        net: FakeNet,
        configure: impl FnOnce(&mut ManagerConfig),
        storage: Option<Box<dyn Storage>>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ManagerConfig::default().with_home(dir.path().join("home"));
        config.chunk_size = 1024;
        config.progress_interval = Duration::ZERO;
        config.retry_backoff = Duration::from_millis(10);
        config.settle_timeout = Duration::from_secs(5);
        config.worker_idle_wait = Duration::from_millis(50);
        configure(&mut config);
        let models = dir.path().join("models");
        let net = Arc::new(net);
        let (manager, events) = build(&config, &models, &net, storage);
        Self {
            manager,
            events,
            config,
            models,
            net,
            _dir: dir,
        }
    }

    /// Drops the current manager and starts a fresh one over the same disk.
    fn restart(&mut self) {
        let (manager, events) = build(&self.config, &self.models, &self.net, None);
        self.manager = manager;
        self.events = events;
    }

    fn download(&self, filename: &str, url: &str, extra: serde_json::Value) -> TaskId {
        let mut params = json!({"url": url, "type": "loras", "filename": filename});
        if let Some(extra) = extra.as_object() {
            for (key, value) in extra {
                params[key] = value.clone();
            }
        }
        self.manager.create(TaskKind::DownloadModel, params).unwrap().id
    }

    fn model(&self, filename: &str) -> PathBuf {
        self.models.join("loras").join(filename)
    }

    fn state(&self, id: &TaskId) -> TaskState {
        self.manager.get(id).unwrap().status
    }

    fn wait_state(&self, id: &TaskId, state: TaskState) {
        wait_until(|| self.state(id) == state);
        assert!(self.manager.wait_idle(WAIT));
    }

    fn drain_events(&self) -> Vec<Event> {
        self.events.try_iter().collect()
    }
}

fn build(
    config: &ManagerConfig,
    models: &Path,
    net: &Arc<FakeNet>,
    storage: Option<Box<dyn Storage>>,
) -> (TaskManager, Receiver<Event>) {
    let broadcaster = Arc::new(Broadcaster::new());
    let events = broadcaster.subscribe();
    let mut builder = TaskManager::builder(config.clone(), PathRegistry::with_defaults(models))
        .with_net_client(net.clone())
        .with_broadcaster(broadcaster);
    if let Some(storage) = storage {
        builder = builder.with_storage(storage);
    }
    (builder.build().unwrap(), events)
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

#[test]
fn download_places_model_with_sidecar() {
    let h = Harness::new(FakeNet::new());
    let body = payload(1024 * 1024);
    h.net.serve("https://example.com/a", body.clone());

    let id = h.download("a.safetensors", "https://example.com/a", json!({"sizeKb": 1024}));
    h.wait_state(&id, TaskState::Completed);

    let target = h.model("a.safetensors");
    assert_eq!(fs::read(&target).unwrap(), body);
    let sidecar = read_sidecar(&target).unwrap();
    assert!(sidecar.contains_key("description"));
    assert_eq!(sidecar["sizeBytes"], 1024 * 1024);
    assert!(!descriptor_path(&h.config.download_dir, &id).exists());
    assert!(!partial_path(&h.config.download_dir, &id).exists());
    assert_eq!(h.manager.get(&id).unwrap().progress, 100.0);

    let kinds: Vec<EventKind> = h.drain_events().into_iter().map(|event| event.kind).collect();
    assert_eq!(kinds.first(), Some(&EventKind::CreateDownloadTask));
    assert!(kinds.contains(&EventKind::UpdateDownloadTask));
    assert_eq!(kinds.last(), Some(&EventKind::CompleteDownloadTask));
}

#[test]
fn existing_model_settles_without_network() {
    let h = Harness::new(FakeNet::new());
    let target = h.model("b.safetensors");
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, payload(10)).unwrap();
    fs::write(sidecar_path(&target), b"{}").unwrap();

    let id = h.download("b.safetensors", "https://example.com/b", json!({"sizeBytes": 10}));
    assert_eq!(h.state(&id), TaskState::ModelExists);
    assert_eq!(h.net.calls(), 0);
    assert!(!descriptor_path(&h.config.download_dir, &id).exists());
}

#[test]
fn stale_model_without_sidecar_is_replaced() {
    let h = Harness::new(FakeNet::new());
    let body = payload(5000);
    h.net.serve("https://example.com/c", body.clone());
    let target = h.model("c.safetensors");
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, b"old").unwrap();

    let id = h.download("c.safetensors", "https://example.com/c", json!({}));
    h.wait_state(&id, TaskState::Completed);
    assert_eq!(fs::read(&target).unwrap(), body);
}

#[test]
fn pause_and_resume_converge_on_exact_bytes() {
    let h = Harness::new(FakeNet::slow());
    let body = payload(256 * 1024);
    h.net.serve("https://example.com/big", body.clone());
    let id = h.download("big.safetensors", "https://example.com/big", json!({}));
    let partial = partial_path(&h.config.download_dir, &id);

    let mut last = 0u64;
    for _ in 0..2 {
        wait_until(|| fs::metadata(&partial).map(|m| m.len() > last).unwrap_or(false));
        h.manager.pause(&id).unwrap();
        h.wait_state(&id, TaskState::Paused);
        let size = fs::metadata(&partial).unwrap().len();
        assert!(size >= last);
        assert!(size < body.len() as u64);
        assert_eq!(h.manager.status(&id).unwrap().state, TaskState::Paused);
        last = size;
        h.manager.resume(&id).unwrap();
    }

    h.wait_state(&id, TaskState::Completed);
    let target = h.model("big.safetensors");
    assert_eq!(fs::read(&target).unwrap(), body);
    assert_eq!(
        sha256_file(&target).unwrap(),
        hex::encode(<sha2::Sha256 as sha2::Digest>::digest(&body))
    );
}

#[test]
fn delete_after_pause_removes_everything() {
    let h = Harness::new(FakeNet::slow());
    h.net.serve("https://example.com/d", payload(256 * 1024));
    let id = h.download("d.safetensors", "https://example.com/d", json!({}));
    let partial = partial_path(&h.config.download_dir, &id);

    wait_until(|| fs::metadata(&partial).map(|m| m.len() > 0).unwrap_or(false));
    h.manager.pause(&id).unwrap();
    h.wait_state(&id, TaskState::Paused);
    h.drain_events();

    h.manager.delete(&id).unwrap();
    assert!(matches!(h.manager.get(&id), Err(CoreError::NotFound(_))));
    assert!(!partial.exists());
    assert!(!descriptor_path(&h.config.download_dir, &id).exists());
    assert!(!h.model("d.safetensors").exists());
    assert!(h
        .drain_events()
        .iter()
        .any(|event| event.kind == EventKind::DeleteDownloadTask));
    assert!(matches!(h.manager.delete(&id), Err(CoreError::NotFound(_))));
}

#[test]
fn cancel_discards_partial() {
    let h = Harness::new(FakeNet::slow());
    h.net.serve("https://example.com/e", payload(256 * 1024));
    let id = h.download("e.safetensors", "https://example.com/e", json!({}));
    let partial = partial_path(&h.config.download_dir, &id);

    wait_until(|| fs::metadata(&partial).map(|m| m.len() > 0).unwrap_or(false));
    h.manager.cancel(&id).unwrap();
    h.wait_state(&id, TaskState::Cancelled);
    assert!(!partial.exists());
    assert!(!descriptor_path(&h.config.download_dir, &id).exists());
    assert!(!h.model("e.safetensors").exists());
    assert!(h.manager.resume(&id).is_err());
}

#[test]
fn html_response_means_login_required() {
    let h = Harness::new(FakeNet::new());
    h.net
        .serve_with("https://civitai.com/api/download/models/9", b"<html>".to_vec(), 200, Some("text/html; charset=utf-8"));
    let id = h.download("f.safetensors", "https://civitai.com/api/download/models/9", json!({}));
    h.wait_state(&id, TaskState::Error);

    let error = h.manager.get(&id).unwrap().error.unwrap();
    assert!(error.contains("authentication required for civitai"), "{}", error);
    assert!(error.contains("API key"), "{}", error);
    assert!(descriptor_path(&h.config.download_dir, &id).exists());
    assert!(h
        .drain_events()
        .iter()
        .any(|event| event.kind == EventKind::ErrorDownloadTask));
}

#[test]
fn unauthorized_status_is_auth_error() {
    let h = Harness::new(FakeNet::new());
    h.net.serve_with("https://huggingface.co/x/resolve/main/g.safetensors", Vec::new(), 401, None);
    let id = h.download(
        "g.safetensors",
        "https://huggingface.co/x/resolve/main/g.safetensors",
        json!({}),
    );
    h.wait_state(&id, TaskState::Error);
    let error = h.manager.get(&id).unwrap().error.unwrap();
    assert!(error.contains("authentication required"), "{}", error);
    assert_eq!(h.net.calls(), 1);
}

#[test]
fn server_size_overrides_hint() {
    let h = Harness::new(FakeNet::new());
    let body = payload(3000);
    h.net.serve("https://example.com/h", body.clone());
    let id = h.download("h.safetensors", "https://example.com/h", json!({"sizeKb": 1}));
    h.wait_state(&id, TaskState::Completed);
    assert_eq!(fs::read(h.model("h.safetensors")).unwrap().len(), 3000);
}

#[test]
fn hash_mismatch_is_not_placed() {
    let h = Harness::new(FakeNet::new());
    h.net.serve("https://example.com/i", payload(2048));
    let id = h.download(
        "i.safetensors",
        "https://example.com/i",
        json!({"hashes": {"SHA256": "00".repeat(32)}}),
    );
    h.wait_state(&id, TaskState::Error);
    assert!(!h.model("i.safetensors").exists());
    assert!(!partial_path(&h.config.download_dir, &id).exists());
    let error = h.manager.get(&id).unwrap().error.unwrap();
    assert!(error.contains("integrity"), "{}", error);
}

#[test]
fn rejected_parameters_create_nothing() {
    let h = Harness::new(FakeNet::new());
    let err = h
        .manager
        .create(
            TaskKind::DownloadModel,
            json!({"url": "https://example.com/x", "type": "nope", "filename": "x.safetensors"}),
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    let err = h
        .manager
        .create(
            TaskKind::DownloadModel,
            json!({"url": "https://example.com/x", "type": "loras", "filename": "x.txt"}),
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    let err = h
        .manager
        .create(TaskKind::ScanInformation, json!({"mode": "everything"}))
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert!(h.manager.list(None).is_empty());
}

#[test]
fn task_without_handler_fails() {
    let h = Harness::new(FakeNet::new());
    assert!(h.manager.unregister_handler(TaskKind::ScanInformation).is_some());
    let task = h
        .manager
        .create(TaskKind::ScanInformation, json!({"mode": "full"}))
        .unwrap();
    assert_eq!(task.status, TaskState::Error);
    assert!(task.error.unwrap().contains("no handler registered"));
}

#[test]
fn list_is_newest_first_and_filters() {
    let h = Harness::new(FakeNet::new());
    h.manager.unregister_handler(TaskKind::ScanInformation);
    let first = h.manager.create(TaskKind::ScanInformation, json!({"mode": "diff"})).unwrap();
    let second = h.manager.create(TaskKind::ScanInformation, json!({"mode": "full"})).unwrap();
    let ids: Vec<TaskId> = h.manager.list(None).into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert_eq!(h.manager.list(Some(TaskState::Error)).len(), 2);
    assert!(h.manager.list(Some(TaskState::Running)).is_empty());
}

#[test]
fn scan_dedups_by_content_hash() {
    let h = Harness::new(FakeNet::new());
    let loras = h.models.join("loras");
    fs::create_dir_all(loras.join("sub")).unwrap();
    fs::write(loras.join("x.safetensors"), b"same").unwrap();
    fs::write(loras.join("sub").join("y.safetensors"), b"same").unwrap();
    fs::write(sidecar_path(&loras.join("sub").join("y.safetensors")), br#"{"name":"y"}"#).unwrap();
    fs::write(loras.join("z.safetensors"), b"other").unwrap();
    fs::write(loras.join("notes.txt"), b"same").unwrap();

    let records = h
        .manager
        .scan_cache()
        .scan_now("loras", None, &TaskControl::new(), &mut |_, _| {})
        .unwrap();
    assert_eq!(records.len(), 2);
    let same = records.iter().find(|r| r.size == 4).unwrap();
    assert_eq!(same.filename, "y.safetensors");
    assert_eq!(same.sub_folder, "sub");
}

#[test]
fn scan_task_reports_records() {
    let h = Harness::new(FakeNet::new());
    let loras = h.models.join("loras");
    fs::create_dir_all(&loras).unwrap();
    fs::write(loras.join("x.safetensors"), b"one").unwrap();

    let task = h
        .manager
        .create(TaskKind::ScanModels, json!({"folder": "loras"}))
        .unwrap();
    h.wait_state(&task.id, TaskState::Completed);
    let events = h.drain_events();
    assert!(events.iter().any(|e| e.kind == EventKind::ModelFound));
    assert!(events.iter().any(|e| e.kind == EventKind::ScanComplete));
    let complete = events
        .iter()
        .find(|e| e.kind == EventKind::CompleteDownloadTask)
        .unwrap();
    assert_eq!(complete.data["result"]["count"], 1);
    assert_eq!(complete.data["type"], "scan_models");
}

#[test]
fn fresh_scan_cache_walks_once() {
    let h = Harness::new(FakeNet::new());
    let loras = h.models.join("loras");
    fs::create_dir_all(&loras).unwrap();
    fs::write(loras.join("x.safetensors"), b"one").unwrap();
    let scan = h.manager.scan_cache();

    let first = scan.request("loras").unwrap();
    assert!(first.is_scanning);
    assert!(scan.wait_for_scans(WAIT));
    let second = scan.request("loras").unwrap();
    assert!(!second.is_scanning);
    assert_eq!(second.records.len(), 1);
    assert_eq!(scan.request("loras").unwrap().records.len(), 1);
    assert_eq!(scan.walk_count(), 1);
    assert!(scan.request("unknown").is_err());
}

#[test]
fn metadata_task_writes_sidecar() {
    let h = Harness::new(FakeNet::new());
    let model = h.model("m.safetensors");
    fs::create_dir_all(model.parent().unwrap()).unwrap();
    fs::write(&model, b"weights").unwrap();

    let task = h
        .manager
        .create(
            TaskKind::UpdateMetadata,
            json!({"modelPath": model.to_string_lossy()}),
        )
        .unwrap();
    h.wait_state(&task.id, TaskState::Completed);
    let sidecar = read_sidecar(&model).unwrap();
    assert_eq!(sidecar["sha256"], sha256_file(&model).unwrap());
    assert_eq!(sidecar["type"], "loras");
}

#[test]
fn paused_download_survives_restart() {
    let mut h = Harness::new(FakeNet::slow());
    let body = payload(128 * 1024);
    h.net.serve("https://example.com/r", body.clone());
    let id = h.download("r.safetensors", "https://example.com/r", json!({}));
    let partial = partial_path(&h.config.download_dir, &id);
    wait_until(|| fs::metadata(&partial).map(|m| m.len() > 0).unwrap_or(false));
    h.manager.pause(&id).unwrap();
    h.wait_state(&id, TaskState::Paused);

    h.restart();
    assert_eq!(h.manager.restore().unwrap(), 1);
    assert_eq!(h.state(&id), TaskState::Paused);
    let status = h.manager.status(&id).unwrap();
    assert!(status.downloaded_size > 0);
    assert_eq!(status.total_size, body.len() as u64);

    assert_eq!(h.manager.resume_all().unwrap(), 1);
    h.wait_state(&id, TaskState::Completed);
    assert_eq!(fs::read(h.model("r.safetensors")).unwrap(), body);
}

#[test]
fn pause_rejects_non_download_tasks() {
    let h = Harness::new(FakeNet::new());
    let task = h
        .manager
        .create(TaskKind::ScanModels, json!({"folder": "loras"}))
        .unwrap();
    assert!(matches!(h.manager.pause(&task.id), Err(CoreError::InvalidState(_))));
    assert!(matches!(
        h.manager.pause(&uuid::Uuid::new_v4()),
        Err(CoreError::NotFound(_))
    ));
}

#[test]
fn transient_statuses_are_retried() {
    let h = Harness::new(FakeNet::new());
    let body = payload(6000);
    h.net.serve("https://example.com/t", body.clone());
    h.net.fail_next(&[503, 429]);

    let id = h.download("t.safetensors", "https://example.com/t", json!({}));
    h.wait_state(&id, TaskState::Completed);
    assert_eq!(h.net.calls(), 3);
    assert_eq!(fs::read(h.model("t.safetensors")).unwrap(), body);
}

#[test]
fn stalled_read_resumes_from_partial() {
    let h = Harness::new(FakeNet::new());
    let body = payload(10_000);
    h.net.serve("https://example.com/s", body.clone());
    h.net.stall_next_after(3000);

    let id = h.download("s.safetensors", "https://example.com/s", json!({}));
    h.wait_state(&id, TaskState::Completed);
    assert_eq!(h.net.ranges("https://example.com/s"), vec![None, Some(3000)]);
    assert_eq!(fs::read(h.model("s.safetensors")).unwrap(), body);
}

#[test]
fn persistent_server_error_surfaces_after_retries() {
    let h = Harness::new(FakeNet::new());
    h.net.serve_with("https://example.com/p", Vec::new(), 500, None);

    let id = h.download("p.safetensors", "https://example.com/p", json!({}));
    h.wait_state(&id, TaskState::Error);
    assert_eq!(h.net.calls(), 1 + h.config.retry_count as usize);
    let error = h.manager.get(&id).unwrap().error.unwrap();
    assert!(error.contains("http status 500"), "{}", error);
    assert!(descriptor_path(&h.config.download_dir, &id).exists());
}

#[test]
fn task_timeout_fails_running_download_and_keeps_partial() {
    let h = Harness::with(
        FakeNet::slow(),
        |config| config.task_timeout = Duration::from_secs(1),
        None,
    );
    let body = payload(512 * 1024);
    h.net.serve("https://example.com/slow", body.clone());

    let id = h.download("slow.safetensors", "https://example.com/slow", json!({}));
    wait_until(|| h.state(&id) == TaskState::Running);
    h.wait_state(&id, TaskState::Error);

    let error = h.manager.get(&id).unwrap().error.unwrap();
    assert!(error.contains("timed out"), "{}", error);
    assert!(error.contains("resume the task"), "{}", error);
    let partial = partial_path(&h.config.download_dir, &id);
    let size = fs::metadata(&partial).unwrap().len();
    assert!(size > 0 && size < body.len() as u64);
    assert!(descriptor_path(&h.config.download_dir, &id).exists());
    assert!(!h.model("slow.safetensors").exists());
    assert_eq!(h.manager.pool_status().claimed, 0);
}

/// Runs once, ignores its control token and finishes when the test says so.
struct GatedHandler {
    runs: AtomicUsize,
    gate: Mutex<Receiver<()>>,
}

impl TaskHandler for GatedHandler {
    fn run(&self, _task: &Task, _ctx: &TaskContext<'_>) -> CoreResult<HandlerOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let _ = self.gate.lock().unwrap().recv_timeout(WAIT);
        Ok(HandlerOutcome::Completed(json!({"path": "gated"})))
    }
}

#[test]
fn completion_after_pause_and_resume_is_kept() {
    let h = Harness::with(FakeNet::new(), |_| {}, Some(Box::new(MemoryStorage::default())));
    let (release, gate) = mpsc::channel();
    let handler = Arc::new(GatedHandler {
        runs: AtomicUsize::new(0),
        gate: Mutex::new(gate),
    });
    h.manager.register_handler(TaskKind::DownloadModel, handler.clone());

    let id = h.download("gated.safetensors", "https://example.com/gated", json!({}));
    assert!(!descriptor_path(&h.config.download_dir, &id).exists());
    wait_until(|| handler.runs.load(Ordering::SeqCst) == 1 && h.state(&id) == TaskState::Running);

    h.manager.pause(&id).unwrap();
    h.manager.resume(&id).unwrap();
    assert_eq!(h.state(&id), TaskState::Pending);
    release.send(()).unwrap();

    h.wait_state(&id, TaskState::Completed);
    assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    let complete = h
        .drain_events()
        .into_iter()
        .find(|event| event.kind == EventKind::CompleteDownloadTask)
        .unwrap();
    assert_eq!(complete.data["result"]["path"], "gated");
}

#[test]
fn information_task_updates_sidecars_and_records_failures() {
    let h = Harness::new(FakeNet::new());
    h.manager.credentials().set("civitai", Some("secret-key-123")).unwrap();
    let known = h.model("known.safetensors");
    let unknown = h.model("unknown.safetensors");
    let described = h.models.join("checkpoints").join("described.safetensors");
    fs::create_dir_all(known.parent().unwrap()).unwrap();
    fs::create_dir_all(described.parent().unwrap()).unwrap();
    fs::write(&known, b"known weights").unwrap();
    fs::write(&unknown, b"unknown weights").unwrap();
    fs::write(&described, b"described weights").unwrap();
    fs::write(sidecar_path(&described), br#"{"note":"keep"}"#).unwrap();

    let known_hash = sha256_file(&known).unwrap();
    let version = json!({
        "id": 11,
        "modelId": 5,
        "name": "v2",
        "baseModel": "SD 1.5",
        "model": {"name": "Known Lora", "type": "LORA", "description": "a known model"},
        "images": [
            {"url": "https://image.civitai.com/known.jpeg"},
            {"url": "https://image.civitai.com/second.jpeg"}
        ],
    });
    h.net.serve_with(
        &format!("{}{}", CIVITAI_BY_HASH_URL, known_hash),
        serde_json::to_vec(&version).unwrap(),
        200,
        Some("application/json"),
    );
    h.net
        .serve_with("https://image.civitai.com/known.jpeg", b"jpeg".to_vec(), 200, Some("image/jpeg"));

    let task = h
        .manager
        .create(TaskKind::ScanInformation, json!({"mode": "diff"}))
        .unwrap();
    h.wait_state(&task.id, TaskState::Completed);

    let sidecar = read_sidecar(&known).unwrap();
    assert_eq!(sidecar["name"], "Known Lora");
    assert_eq!(sidecar["versionId"], 11);
    assert_eq!(sidecar["sha256"], known_hash.as_str());
    assert_eq!(sidecar["description"], "a known model");
    let preview = preview_target(&known, "jpeg").unwrap();
    assert_eq!(fs::read(preview).unwrap(), b"jpeg");
    assert!(read_sidecar(&unknown).is_none());
    assert_eq!(read_sidecar(&described).unwrap().len(), 1);

    let complete = h
        .drain_events()
        .into_iter()
        .find(|event| event.kind == EventKind::CompleteDownloadTask)
        .unwrap();
    let result = &complete.data["result"];
    assert_eq!(result["count"], 3);
    assert_eq!(result["updated"], 1);
    assert_eq!(result["skipped"], 1);
    let errors = result["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["path"], unknown.to_string_lossy().to_string());
    assert!(errors[0]["error"].as_str().unwrap().contains("404"));
    assert!(h
        .net
        .tokens(CIVITAI_BY_HASH_URL)
        .iter()
        .all(|token| token.as_deref() == Some("secret-key-123")));
}

#[test]
fn full_information_scan_merges_into_existing_sidecar() {
    let h = Harness::new(FakeNet::new());
    let model = h.models.join("checkpoints").join("described.safetensors");
    fs::create_dir_all(model.parent().unwrap()).unwrap();
    fs::write(&model, b"described weights").unwrap();
    fs::write(sidecar_path(&model), br#"{"note":"keep"}"#).unwrap();
    h.net.serve_with(
        &format!("{}{}", CIVITAI_BY_HASH_URL, sha256_file(&model).unwrap()),
        serde_json::to_vec(&json!({"id": 3, "modelId": 1, "model": {"name": "Base"}})).unwrap(),
        200,
        Some("application/json"),
    );

    let task = h
        .manager
        .create(TaskKind::ScanInformation, json!({"mode": "full", "path": "checkpoints"}))
        .unwrap();
    h.wait_state(&task.id, TaskState::Completed);

    let sidecar = read_sidecar(&model).unwrap();
    assert_eq!(sidecar["note"], "keep");
    assert_eq!(sidecar["name"], "Base");
    assert_eq!(sidecar["source"], "civitai");
    assert_eq!(h.manager.get(&task.id).unwrap().progress, 100.0);
}

#[test]
fn placed_download_marks_category_scan_stale() {
    let h = Harness::new(FakeNet::new());
    fs::create_dir_all(h.models.join("loras")).unwrap();
    let scan = h.manager.scan_cache();
    scan.request("loras").unwrap();
    assert!(scan.wait_for_scans(WAIT));
    assert!(scan.request("loras").unwrap().records.is_empty());

    h.net.serve("https://example.com/n", payload(2048));
    let id = h.download("n.safetensors", "https://example.com/n", json!({}));
    h.wait_state(&id, TaskState::Completed);

    let stale = scan.request("loras").unwrap();
    assert!(stale.is_scanning);
    assert!(scan.wait_for_scans(WAIT));
    assert_eq!(scan.request("loras").unwrap().records.len(), 1);
    assert_eq!(scan.walk_count(), 2);
}
