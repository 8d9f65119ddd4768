use std::collections::HashMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::config::ManagerConfig;
use crate::content::{partial_path, recompute, TaskContent, TaskStatus};
use crate::control::TaskControl;
use crate::credentials::CredentialStore;
use crate::download::DownloadEngine;
use crate::error::{CoreError, CoreResult};
use crate::events::{Broadcaster, EventKind};
use crate::handlers::{
    DownloadHandler, HandlerOutcome, MetadataHandler, ScanHandler, TaskContext, TaskHandler,
    TaskHost,
};
use crate::information::InformationHandler;
use crate::net::{NetClient, ReqwestNetClient};
use crate::paths::PathRegistry;
use crate::pool::{Job, PoolStatus, SubmitStatus, WorkerPool};
use crate::scan::ScanCache;
use crate::storage::{FileStorage, Storage};
use crate::task::{Task, TaskId, TaskKind, TaskParams, TaskState};

struct Entry {
    task: Task,
    control: TaskControl,
    /// Submitted to the pool and not yet released.
    in_flight: bool,
    resume_requested: bool,
    seq: u64,
}

struct Shared {
    config: ManagerConfig,
    tasks: Mutex<HashMap<TaskId, Entry>>,
    settled: Condvar,
    next_seq: Mutex<u64>,
    store: Mutex<Box<dyn Storage>>,
    statuses: Mutex<HashMap<TaskId, TaskStatus>>,
    handlers: RwLock<HashMap<TaskKind, Arc<dyn TaskHandler>>>,
    broadcaster: Arc<Broadcaster>,
    pool: WorkerPool,
}

pub struct TaskManagerBuilder {
    config: ManagerConfig,
    paths: PathRegistry,
    net: Option<Arc<dyn NetClient>>,
    storage: Option<Box<dyn Storage>>,
    broadcaster: Option<Arc<Broadcaster>>,
}

impl TaskManagerBuilder {
    pub fn with_net_client(mut self, net: Arc<dyn NetClient>) -> Self {
        self.net = Some(net);
        self
    }

    pub fn with_storage(mut self, storage: Box<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn build(self) -> CoreResult<TaskManager> {
        let config = self.config;
        fs::create_dir_all(&config.download_dir)?;
        let net: Arc<dyn NetClient> = match self.net {
            Some(net) => net,
            None => Arc::new(ReqwestNetClient::new(
                &config.user_agent,
                config.connect_timeout,
                config.read_timeout,
            )?),
        };
        let storage = match self.storage {
            Some(storage) => storage,
            None => Box::new(FileStorage::new(&config.download_dir)?),
        };
        let broadcaster = self.broadcaster.unwrap_or_default();
        let paths = Arc::new(self.paths);
        let credentials = Arc::new(CredentialStore::open(config.credential_file()));
        let scan = ScanCache::new(config.clone(), Arc::clone(&paths), Arc::clone(&broadcaster));
        let engine = Arc::new(DownloadEngine::new(
            config.clone(),
            Arc::clone(&net),
            Arc::clone(&credentials),
            Arc::clone(&paths),
        ));

        let mut handlers: HashMap<TaskKind, Arc<dyn TaskHandler>> = HashMap::new();
        handlers.insert(
            TaskKind::DownloadModel,
            Arc::new(DownloadHandler::new(
                engine,
                scan.clone(),
                config.download_dir.clone(),
                config.size_tolerance_bytes,
            )),
        );
        handlers.insert(TaskKind::ScanModels, Arc::new(ScanHandler::new(scan.clone())));
        handlers.insert(TaskKind::UpdateMetadata, Arc::new(MetadataHandler));
        handlers.insert(
            TaskKind::ScanInformation,
            Arc::new(InformationHandler::new(
                net,
                Arc::clone(&paths),
                Arc::clone(&credentials),
                config.task_timeout,
            )),
        );

        let pool = WorkerPool::new(
            config.max_concurrent_tasks,
            config.task_timeout,
            config.worker_idle_wait,
        );
        tracing::debug!(
            download_dir = %config.download_dir.display(),
            max_tasks = config.max_concurrent_tasks,
            "task manager ready"
        );
        Ok(TaskManager {
            shared: Arc::new(Shared {
                config,
                tasks: Mutex::new(HashMap::new()),
                settled: Condvar::new(),
                next_seq: Mutex::new(0),
                store: Mutex::new(storage),
                statuses: Mutex::new(HashMap::new()),
                handlers: RwLock::new(handlers),
                broadcaster,
                pool,
            }),
            paths,
            credentials,
            scan,
        })
    }
}

/// Owns every task, its descriptor and its live status. Handlers run on
/// the worker pool; their outcomes are applied here.
pub struct TaskManager {
    shared: Arc<Shared>,
    paths: Arc<PathRegistry>,
    credentials: Arc<CredentialStore>,
    scan: ScanCache,
}

impl TaskManager {
    pub fn builder(config: ManagerConfig, paths: PathRegistry) -> TaskManagerBuilder {
        TaskManagerBuilder {
            config,
            paths,
            net: None,
            storage: None,
            broadcaster: None,
        }
    }

    pub fn new(config: ManagerConfig, paths: PathRegistry) -> CoreResult<Self> {
        Self::builder(config, paths).build()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn paths(&self) -> &PathRegistry {
        &self.paths
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.shared.broadcaster
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn scan_cache(&self) -> &ScanCache {
        &self.scan
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.shared.pool.status()
    }

    pub fn register_handler(&self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        match self.shared.handlers.write() {
            Ok(mut handlers) => {
                handlers.insert(kind, handler);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(kind, handler);
            }
        }
    }

    /// Tasks of `kind` created afterwards fail with no handler.
    pub fn unregister_handler(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
    }

    /// Validates and records a task, persists its descriptor (downloads)
    /// and hands it to the pool.
    pub fn create(&self, kind: TaskKind, params: Value) -> CoreResult<Task> {
        let params = TaskParams::parse(kind, params)?;
        let task = Task::new(params);
        let id = task.id;

        if let Some(download) = task.params.as_download() {
            self.paths
                .root(&download.category, download.path_index)
                .map_err(|err| CoreError::Validation(err.to_string()))?;
            if !self.paths.accepts(&download.category, &download.filename) {
                return Err(CoreError::Validation(format!(
                    "{} is not an allowed file type for {}",
                    download.filename, download.category
                )));
            }
            let platform = download
                .resolved_platform()?
                .map(|platform| platform.as_str().to_string());
            let content = TaskContent::from_params(id, download, platform);
            self.shared.store()?.save_content(&content)?;
            let mut status = recompute(&content, &self.shared.config.download_dir);
            status.state = TaskState::Pending;
            self.shared.statuses().insert(id, status);
        }

        self.shared.insert(task.clone(), TaskControl::new());
        tracing::info!(task_id = %id, kind = %kind, "task created");
        self.shared.emit(EventKind::CreateDownloadTask, &task, None);
        Shared::dispatch(&self.shared, id)?;
        self.get(&id)
    }

    pub fn get(&self, id: &TaskId) -> CoreResult<Task> {
        self.shared
            .tasks()
            .get(id)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| CoreError::NotFound(format!("task {}", id)))
    }

    /// Newest first, optionally filtered by state.
    pub fn list(&self, state: Option<TaskState>) -> Vec<Task> {
        let tasks = self.shared.tasks();
        let mut entries: Vec<&Entry> = tasks
            .values()
            .filter(|entry| state.map(|state| entry.task.status == state).unwrap_or(true))
            .collect();
        entries.sort_by(|a, b| {
            b.task
                .created_at
                .cmp(&a.task.created_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        entries.into_iter().map(|entry| entry.task.clone()).collect()
    }

    /// Live transfer view of a download, rebuilt from disk when not cached.
    pub fn status(&self, id: &TaskId) -> CoreResult<TaskStatus> {
        if let Some(status) = self.shared.statuses().get(id) {
            return Ok(status.clone());
        }
        let content = self.shared.store()?.load_content(id)?;
        let mut status = recompute(&content, &self.shared.config.download_dir);
        if let Some(entry) = self.shared.tasks().get(id) {
            status.state = entry.task.status;
            status.error = entry.task.error.clone();
        }
        Ok(status)
    }

    pub fn pause(&self, id: &TaskId) -> CoreResult<()> {
        let task = {
            let mut tasks = self.shared.tasks();
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| CoreError::NotFound(format!("task {}", id)))?;
            require_download(&entry.task, "pause")?;
            match entry.task.status {
                TaskState::Paused => return Ok(()),
                TaskState::Running | TaskState::Pending => {
                    entry.control.pause();
                    entry.task.status = TaskState::Paused;
                }
                other => {
                    return Err(CoreError::InvalidState(format!(
                        "cannot pause task in state {}",
                        other
                    )))
                }
            }
            entry.task.clone()
        };
        tracing::info!(task_id = %id, "task paused");
        self.shared.set_status_state(id, TaskState::Paused, None);
        self.shared.emit(EventKind::UpdateDownloadTask, &task, None);
        Ok(())
    }

    /// PAUSED or ERROR downloads go back to PENDING and are re-queued; the
    /// partial file is reused.
    pub fn resume(&self, id: &TaskId) -> CoreResult<()> {
        let (task, dispatch_now) = {
            let mut tasks = self.shared.tasks();
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| CoreError::NotFound(format!("task {}", id)))?;
            require_download(&entry.task, "resume")?;
            match entry.task.status {
                TaskState::Pending | TaskState::Running => return Ok(()),
                TaskState::Paused | TaskState::Error => {
                    entry.task.status = TaskState::Pending;
                    entry.task.error = None;
                    entry.task.completed_at = None;
                }
                other => {
                    return Err(CoreError::InvalidState(format!(
                        "cannot resume task in state {}",
                        other
                    )))
                }
            }
            let dispatch_now = if entry.in_flight {
                entry.resume_requested = true;
                false
            } else {
                true
            };
            (entry.task.clone(), dispatch_now)
        };
        tracing::info!(task_id = %id, "task resumed");
        self.shared.set_status_state(id, TaskState::Pending, None);
        self.shared.emit(EventKind::UpdateDownloadTask, &task, None);
        if dispatch_now {
            Shared::dispatch(&self.shared, *id)?;
        }
        Ok(())
    }

    /// Stops a live task. Paused, pending and failed downloads are cancelled
    /// too and lose their partial file. Finished tasks are left alone.
    pub fn cancel(&self, id: &TaskId) -> CoreResult<()> {
        let (task, purge_now) = {
            let mut tasks = self.shared.tasks();
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| CoreError::NotFound(format!("task {}", id)))?;
            let cancellable = match entry.task.status {
                TaskState::Running | TaskState::Pending | TaskState::Paused => true,
                TaskState::Error => entry.task.kind() == TaskKind::DownloadModel,
                _ => false,
            };
            if !cancellable {
                return Ok(());
            }
            entry.control.cancel();
            entry.task.mark_finished(TaskState::Cancelled, None);
            (entry.task.clone(), !entry.in_flight)
        };
        tracing::info!(task_id = %id, "task cancelled");
        if purge_now {
            self.shared.purge_artifacts(id);
        }
        self.shared.set_status_state(id, TaskState::Cancelled, None);
        self.shared.emit(EventKind::UpdateDownloadTask, &task, None);
        Ok(())
    }

    /// Cancels the task if needed, waits a bounded time for its worker, then
    /// removes the task with its descriptor, partial file and cached status.
    pub fn delete(&self, id: &TaskId) -> CoreResult<()> {
        let known_on_disk = self.shared.store()?.load_content(id).is_ok();
        let removed = {
            let mut tasks = self.shared.tasks();
            if let Some(entry) = tasks.get_mut(id) {
                if !entry.task.status.is_terminal() {
                    entry.control.cancel();
                    entry.task.mark_finished(TaskState::Cancelled, None);
                }
            } else if !known_on_disk {
                return Err(CoreError::NotFound(format!("task {}", id)));
            }

            let deadline = Instant::now() + self.shared.config.settle_timeout;
            while tasks.get(id).map(|entry| entry.in_flight).unwrap_or(false) {
                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!(task_id = %id, "worker did not settle before delete");
                    break;
                }
                tasks = self
                    .shared
                    .settled
                    .wait_timeout(tasks, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            tasks.remove(id)
        };
        self.shared.purge_artifacts(id);
        self.shared.statuses().remove(id);
        tracing::info!(task_id = %id, "task deleted");
        let kind = removed
            .map(|entry| entry.task.kind())
            .unwrap_or(TaskKind::DownloadModel);
        self.shared.broadcaster.broadcast(
            EventKind::DeleteDownloadTask,
            json!({"taskId": id.to_string(), "type": kind.as_str()}),
        );
        Ok(())
    }

    /// Loads every descriptor left in the download directory as a PAUSED
    /// download. Returns the number of tasks restored.
    pub fn restore(&self) -> CoreResult<usize> {
        let contents = self.shared.store()?.list_contents()?;
        let mut restored = 0usize;
        for content in contents {
            if self.shared.tasks().contains_key(&content.task_id) {
                continue;
            }
            let mut task = Task::with_id(content.task_id, TaskParams::DownloadModel(content.to_params()));
            task.created_at = content.created_at;
            task.status = TaskState::Paused;
            let status = recompute(&content, &self.shared.config.download_dir);
            task.set_progress(status.progress);
            self.shared.statuses().insert(task.id, status);
            self.shared.insert(task, TaskControl::new());
            restored += 1;
        }
        if restored > 0 {
            tracing::info!(count = restored, "restored download tasks");
        }
        Ok(restored)
    }

    pub fn resume_all(&self) -> CoreResult<usize> {
        let paused: Vec<TaskId> = self
            .list(Some(TaskState::Paused))
            .into_iter()
            .filter(|task| task.kind() == TaskKind::DownloadModel)
            .map(|task| task.id)
            .collect();
        for id in &paused {
            self.resume(id)?;
        }
        Ok(paused.len())
    }

    /// Blocks until no task is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.shared.tasks();
        while tasks.values().any(|entry| entry.in_flight) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tasks = self
                .shared
                .settled
                .wait_timeout(tasks, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Pauses running downloads, drops queued work and joins the pool. Queued
    /// downloads stay resumable through their descriptors.
    pub fn shutdown(&self) {
        {
            let tasks = self.shared.tasks();
            for entry in tasks.values() {
                if entry.in_flight && entry.task.kind() == TaskKind::DownloadModel {
                    entry.control.pause();
                }
            }
        }
        self.shared.pool.shutdown();
        let mut tasks = self.shared.tasks();
        for entry in tasks.values_mut() {
            if entry.in_flight {
                entry.in_flight = false;
                entry.resume_requested = false;
                if !entry.task.status.is_terminal() {
                    entry.task.status = if entry.task.kind() == TaskKind::DownloadModel {
                        TaskState::Paused
                    } else {
                        TaskState::Cancelled
                    };
                }
            }
        }
        drop(tasks);
        self.shared.settled.notify_all();
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn require_download(task: &Task, action: &str) -> CoreResult<()> {
    if task.kind() != TaskKind::DownloadModel {
        return Err(CoreError::InvalidState(format!(
            "cannot {} a {} task",
            action,
            task.kind()
        )));
    }
    Ok(())
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Entry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn statuses(&self) -> MutexGuard<'_, HashMap<TaskId, TaskStatus>> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self) -> CoreResult<MutexGuard<'_, Box<dyn Storage>>> {
        self.store
            .lock()
            .map_err(|_| CoreError::Storage("storage lock poisoned".to_string()))
    }

    fn insert(&self, task: Task, control: TaskControl) {
        let seq = match self.next_seq.lock() {
            Ok(mut next) => {
                *next += 1;
                *next
            }
            Err(_) => 0,
        };
        self.tasks().insert(
            task.id,
            Entry {
                task,
                control,
                in_flight: false,
                resume_requested: false,
                seq,
            },
        );
    }

    fn handler(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(&kind).cloned()
    }

    fn dispatch(shared: &Arc<Shared>, id: TaskId) -> CoreResult<()> {
        let task = {
            let tasks = shared.tasks();
            match tasks.get(&id) {
                Some(entry) if entry.task.status == TaskState::Pending => entry.task.clone(),
                _ => return Ok(()),
            }
        };
        let Some(handler) = shared.handler(task.kind()) else {
            let message = format!("no handler registered for task type {}", task.kind());
            tracing::warn!(task_id = %id, "{}", message);
            shared.finish(&id, TaskState::Error, Some(message), None);
            return Ok(());
        };

        match handler.precheck(&task, &**shared) {
            Ok(Some(outcome)) => {
                shared.apply(&id, Ok(outcome), &[TaskState::Pending]);
                return Ok(());
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(task_id = %id, "precheck failed: {}", err);
                shared.finish(&id, TaskState::Error, Some(err.user_message()), None);
                return Ok(());
            }
        }

        let mut tasks = shared.tasks();
        let Some(entry) = tasks.get_mut(&id) else {
            return Ok(());
        };
        if entry.task.status != TaskState::Pending {
            return Ok(());
        }
        entry.control.reset();
        let control = entry.control.clone();

        let runner = Arc::clone(shared);
        let timed_out = Arc::clone(shared);
        let released = Arc::clone(shared);
        let job = Job::new(id, control, move || Shared::execute(&runner, id, handler))
            .on_timeout(move || timed_out.timed_out(&id))
            .on_release(move || Shared::released(&released, id));
        match shared.pool.submit(job) {
            Ok(status) => {
                if status != SubmitStatus::Existing {
                    entry.in_flight = true;
                }
                tracing::debug!(task_id = %id, submit = status.as_str(), "task dispatched");
                Ok(())
            }
            Err(err) => {
                entry.task.status = TaskState::Paused;
                Err(err)
            }
        }
    }

    fn execute(shared: &Arc<Shared>, id: TaskId, handler: Arc<dyn TaskHandler>) {
        let (task, control) = {
            let mut tasks = shared.tasks();
            let Some(entry) = tasks.get_mut(&id) else {
                return;
            };
            if entry.task.status != TaskState::Pending {
                tracing::debug!(task_id = %id, status = %entry.task.status, "skipping task no longer pending");
                return;
            }
            entry.task.mark_started();
            (entry.task.clone(), entry.control.clone())
        };
        tracing::info!(task_id = %id, kind = %task.kind(), "task started");
        shared.set_status_state(&id, TaskState::Running, None);

        let ctx = TaskContext {
            control: &control,
            host: &**shared,
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.run(&task, &ctx)))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(CoreError::InvalidState(format!("handler panicked: {}", message)))
            });
        shared.apply(&id, result, &[TaskState::Running]);
    }

    /// Applies a handler result, but only while the task is still in one of
    /// `expected`; a pause, cancel or timeout that landed first wins.
    fn apply(&self, id: &TaskId, result: CoreResult<HandlerOutcome>, expected: &[TaskState]) {
        let (current, resumed) = match self.tasks().get(id) {
            Some(entry) => (
                entry.task.status,
                entry.task.status == TaskState::Pending && entry.resume_requested,
            ),
            None => return,
        };
        match result {
            Ok(HandlerOutcome::Completed(value)) => {
                // A pause, or a pause then resume, that lands after the last
                // byte does not undo a finished download.
                if expected.contains(&current) || current == TaskState::Paused || resumed {
                    if resumed {
                        if let Some(entry) = self.tasks().get_mut(id) {
                            entry.resume_requested = false;
                        }
                    }
                    tracing::info!(task_id = %id, "task completed");
                    self.finish(id, TaskState::Completed, None, Some(value));
                }
            }
            Ok(HandlerOutcome::ModelExists(value)) => {
                if expected.contains(&current) {
                    tracing::info!(task_id = %id, "model exists, nothing to download");
                    self.finish(id, TaskState::ModelExists, None, Some(value));
                }
            }
            Ok(HandlerOutcome::Paused) => {
                if expected.contains(&current) {
                    if let Some(entry) = self.tasks().get_mut(id) {
                        entry.task.status = TaskState::Paused;
                    }
                }
                if current != TaskState::Cancelled {
                    self.set_status_state(id, TaskState::Paused, None);
                }
            }
            Ok(HandlerOutcome::Cancelled) => {
                if !current.is_terminal() {
                    self.finish(id, TaskState::Cancelled, None, None);
                }
            }
            Err(err) => {
                if expected.contains(&current) {
                    tracing::error!(task_id = %id, "task failed: {}", err);
                    self.finish(id, TaskState::Error, Some(err.user_message()), None);
                } else {
                    tracing::debug!(task_id = %id, status = %current, "ignoring late error: {}", err);
                }
            }
        }
    }

    /// Records a terminal state and emits the matching event.
    fn finish(&self, id: &TaskId, state: TaskState, error: Option<String>, result: Option<Value>) {
        let task = {
            let mut tasks = self.tasks();
            let Some(entry) = tasks.get_mut(id) else {
                return;
            };
            entry.task.mark_finished(state, error.clone());
            entry.task.clone()
        };
        self.set_status_state(id, state, error.clone());
        match state {
            TaskState::Completed | TaskState::ModelExists => {
                if let Err(err) = self.store().and_then(|mut store| store.delete_content(id)) {
                    tracing::warn!(task_id = %id, "cannot remove descriptor: {}", err);
                }
                self.emit(EventKind::CompleteDownloadTask, &task, result);
            }
            TaskState::Error => self.emit(EventKind::ErrorDownloadTask, &task, None),
            _ => self.emit(EventKind::UpdateDownloadTask, &task, None),
        }
    }

    fn timed_out(&self, id: &TaskId) {
        let running = self
            .tasks()
            .get(id)
            .map(|entry| entry.task.status == TaskState::Running)
            .unwrap_or(false);
        if running {
            let err = CoreError::Timeout(self.config.task_timeout.as_secs());
            self.finish(id, TaskState::Error, Some(err.user_message()), None);
        }
    }

    fn released(shared: &Arc<Shared>, id: TaskId) {
        let (redispatch, purge) = match shared.tasks().get_mut(&id) {
            Some(entry) => {
                let redispatch =
                    entry.resume_requested && entry.task.status == TaskState::Pending;
                entry.resume_requested = false;
                entry.in_flight = false;
                let purge = entry.task.status == TaskState::Cancelled
                    && entry.task.kind() == TaskKind::DownloadModel;
                (redispatch, purge)
            }
            None => (false, false),
        };
        if purge {
            shared.purge_artifacts(&id);
        }
        if redispatch {
            if let Err(err) = Shared::dispatch(shared, id) {
                tracing::warn!(task_id = %id, "cannot re-dispatch resumed task: {}", err);
            }
        }
        shared.settled.notify_all();
    }

    /// Descriptor and partial file; both may already be gone.
    fn purge_artifacts(&self, id: &TaskId) {
        if let Err(err) = self.store().and_then(|mut store| store.delete_content(id)) {
            tracing::warn!(task_id = %id, "cannot remove descriptor: {}", err);
        }
        let partial = partial_path(&self.config.download_dir, id);
        match fs::remove_file(&partial) {
            Ok(()) => tracing::debug!(task_id = %id, "removed partial file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(task_id = %id, "cannot remove partial file: {}", err),
        }
    }

    fn set_status_state(&self, id: &TaskId, state: TaskState, error: Option<String>) {
        let mut statuses = self.statuses();
        if let Some(status) = statuses.get_mut(id) {
            status.state = state;
            status.error = error;
            if state != TaskState::Running {
                status.bps = 0.0;
            }
            if state == TaskState::Completed || state == TaskState::ModelExists {
                status.progress = 100.0;
                status.downloaded_size = status.total_size;
            }
        }
    }

    fn emit(&self, kind: EventKind, task: &Task, result: Option<Value>) {
        let mut payload = task.summary();
        payload["taskId"] = Value::String(task.id.to_string());
        if let Some(status) = self.statuses().get(&task.id) {
            payload["status_detail"] = serde_json::to_value(status).unwrap_or(Value::Null);
        }
        if let Some(result) = result {
            payload["result"] = result;
        }
        self.broadcaster.broadcast(kind, payload);
    }
}

impl TaskHost for Shared {
    fn report_progress(&self, id: &TaskId, percent: f64) {
        if let Some(entry) = self.tasks().get_mut(id) {
            entry.task.set_progress(percent);
        }
    }

    fn load_content(&self, id: &TaskId) -> CoreResult<TaskContent> {
        self.store()?.load_content(id)
    }

    fn save_content(&self, content: &TaskContent) -> CoreResult<()> {
        self.store()?.save_content(content)
    }

    fn publish_status(&self, status: TaskStatus) {
        let id = status.task_id;
        let mut payload = match self.tasks().get(&id) {
            Some(entry) => entry.task.summary(),
            None => json!({"id": id.to_string()}),
        };
        payload["status_detail"] = serde_json::to_value(&status).unwrap_or(Value::Null);
        self.statuses().insert(id, status);
        self.broadcaster.broadcast(EventKind::UpdateDownloadTask, payload);
    }
}
