use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::control::TaskControl;
use crate::error::{CoreError, CoreResult};
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// The id is already queued or running.
    Existing,
    /// A worker will pick the job up right away.
    Running,
    /// Every worker is busy; the job waits in the queue.
    Waiting,
}

impl SubmitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitStatus::Existing => "Existing",
            SubmitStatus::Running => "Running",
            SubmitStatus::Waiting => "Waiting",
        }
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

pub struct Job {
    pub id: TaskId,
    pub control: TaskControl,
    run: Callback,
    on_timeout: Option<Callback>,
    on_release: Option<Callback>,
}

impl Job {
    pub fn new(id: TaskId, control: TaskControl, run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            control,
            run: Box::new(run),
            on_timeout: None,
            on_release: None,
        }
    }

    /// Runs on the worker thread when the job outlives the task timeout.
    pub fn on_timeout(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(callback));
        self
    }

    /// Runs once the claim on the id is gone, even if the job panicked.
    pub fn on_release(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(callback));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub workers: usize,
    pub max_workers: usize,
    pub claimed: usize,
    pub queued: usize,
    pub shutdown: bool,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    claimed: HashSet<TaskId>,
    workers: usize,
    idle: usize,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
    orphans: Vec<JoinHandle<()>>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
    released: Condvar,
    max_workers: usize,
    task_timeout: Duration,
    idle_wait: Duration,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a claim when dropped, whatever happened to the job, then runs
/// the job's release callback.
struct ClaimGuard {
    inner: Arc<PoolInner>,
    id: TaskId,
    on_release: Option<Callback>,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.claimed.remove(&self.id);
        drop(state);
        self.inner.released.notify_all();
        if let Some(callback) = self.on_release.take() {
            callback();
        }
    }
}

/// Bounded set of worker threads. Each id is claimed from `submit` until its
/// job finishes, so one id never runs twice at the same time.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, task_timeout: Duration, idle_wait: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
                released: Condvar::new(),
                max_workers: max_workers.max(1),
                task_timeout,
                idle_wait,
            }),
        }
    }

    pub fn submit(&self, job: Job) -> CoreResult<SubmitStatus> {
        let mut state = self.inner.lock();
        if state.shutdown {
            return Err(CoreError::InvalidState("worker pool is shut down".to_string()));
        }
        if !state.claimed.insert(job.id) {
            return Ok(SubmitStatus::Existing);
        }
        tracing::debug!(task_id = %job.id, "job queued");
        state.queue.push_back(job);

        if state.idle >= state.queue.len() {
            self.inner.available.notify_one();
            return Ok(SubmitStatus::Running);
        }
        if state.workers < self.inner.max_workers {
            state.handles.retain(|handle| !handle.is_finished());
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name("modelhub-worker".to_string())
                .spawn(move || worker_loop(inner))
                .map_err(|err| CoreError::Io(format!("cannot spawn worker: {}", err)))?;
            state.workers += 1;
            state.handles.push(handle);
            return Ok(SubmitStatus::Running);
        }
        Ok(SubmitStatus::Waiting)
    }

    pub fn is_claimed(&self, id: &TaskId) -> bool {
        self.inner.lock().claimed.contains(id)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            workers: state.workers,
            max_workers: self.inner.max_workers,
            claimed: state.claimed.len(),
            queued: state.queue.len(),
            shutdown: state.shutdown,
        }
    }

    /// Blocks until nothing is queued or claimed. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        while !state.claimed.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Rejects new work, drops queued jobs and joins every worker and every
    /// timed-out job thread, including jobs that time out while shutting
    /// down.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.inner.lock();
            if state.shutdown && state.handles.is_empty() && state.orphans.is_empty() {
                return;
            }
            state.shutdown = true;
            let dropped: Vec<Job> = state.queue.drain(..).collect();
            for job in &dropped {
                state.claimed.remove(&job.id);
            }
            dropped
        };
        if !dropped.is_empty() {
            tracing::info!(count = dropped.len(), "dropping queued jobs on shutdown");
        }
        drop(dropped);
        self.inner.available.notify_all();
        self.inner.released.notify_all();

        let current = thread::current().id();
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut state = self.inner.lock();
                let mut handles: Vec<JoinHandle<()>> = state.handles.drain(..).collect();
                handles.extend(state.orphans.drain(..));
                handles
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.thread().id() == current {
                    continue;
                }
                if handle.join().is_err() {
                    tracing::error!("worker thread panicked during shutdown");
                }
            }
        }
        tracing::debug!("worker pool stopped");
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let job = {
            let mut state = inner.lock();
            loop {
                if state.shutdown {
                    state.workers -= 1;
                    return;
                }
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                state.idle += 1;
                let (guard, wait) = inner
                    .available
                    .wait_timeout(state, inner.idle_wait)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
                state.idle -= 1;
                if wait.timed_out() && state.queue.is_empty() {
                    state.workers -= 1;
                    return;
                }
            }
        };
        run_job(&inner, job);
    }
}

fn run_job(inner: &Arc<PoolInner>, job: Job) {
    let Job {
        id,
        control,
        run,
        on_timeout,
        on_release,
    } = job;
    let claim = ClaimGuard {
        inner: Arc::clone(inner),
        id,
        on_release,
    };
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let spawned = thread::Builder::new()
        .name(format!("modelhub-task-{}", id))
        .spawn(move || {
            if panic::catch_unwind(AssertUnwindSafe(run)).is_err() {
                tracing::error!(task_id = %id, "job panicked");
            }
            drop(claim);
            let _ = done_tx.send(());
        });
    // A failed spawn drops the closure, and with it the claim, which runs
    // the release callback.
    let handle = match spawned {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!(task_id = %id, "cannot spawn job thread: {}", err);
            return;
        }
    };

    match done_rx.recv_timeout(inner.task_timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            let _ = handle.join();
        }
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(
                task_id = %id,
                timeout_secs = inner.task_timeout.as_secs(),
                "task exceeded its timeout"
            );
            control.timeout();
            if let Some(callback) = on_timeout {
                callback();
            }
            inner.lock().orphans.push(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn pool(max: usize) -> WorkerPool {
        WorkerPool::new(max, Duration::from_secs(5), Duration::from_millis(100))
    }

    #[test]
    fn second_submit_of_same_id_is_existing() {
        let pool = pool(2);
        let id = Uuid::new_v4();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let first = Job::new(id, TaskControl::new(), move || {
            let _ = gate_rx.recv();
        });
        assert_eq!(pool.submit(first).unwrap(), SubmitStatus::Running);
        let second = Job::new(id, TaskControl::new(), || {});
        assert_eq!(pool.submit(second).unwrap(), SubmitStatus::Existing);
        gate_tx.send(()).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert!(!pool.is_claimed(&id));
        pool.shutdown();
    }

    #[test]
    fn concurrency_never_exceeds_max() {
        let pool = pool(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut statuses = Vec::new();
        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let job = Job::new(Uuid::new_v4(), TaskControl::new(), move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                running.fetch_sub(1, Ordering::SeqCst);
            });
            statuses.push(pool.submit(job).unwrap());
        }
        assert!(statuses.contains(&SubmitStatus::Waiting));
        assert!(pool.wait_idle(Duration::from_secs(10)));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(pool.status().workers <= 2);
        pool.shutdown();
    }

    #[test]
    fn panicking_job_releases_claim() {
        let pool = pool(1);
        let id = Uuid::new_v4();
        let released = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&released);
        let job = Job::new(id, TaskControl::new(), || panic!("handler blew up"))
            .on_release(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        pool.submit(job).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));
        // on_release runs right after the claim drops
        thread::sleep(Duration::from_millis(50));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn timeout_signals_control_and_frees_the_worker() {
        let pool = WorkerPool::new(1, Duration::from_millis(100), Duration::from_millis(100));
        let control = TaskControl::new();
        let watched = control.clone();
        let timed_out = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&timed_out);
        let slow = Job::new(Uuid::new_v4(), control, move || {
            while !watched.is_stopped() {
                thread::sleep(Duration::from_millis(10));
            }
        })
        .on_timeout(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        pool.submit(slow).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let next = Job::new(Uuid::new_v4(), TaskControl::new(), move || {
            let _ = done_tx.send(());
        });
        pool.submit(next).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn shutdown_waits_for_job_that_times_out_during_shutdown() {
        let pool = WorkerPool::new(1, Duration::from_millis(200), Duration::from_millis(100));
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&finished);
        let id = Uuid::new_v4();
        // Ignores its control token entirely.
        pool.submit(Job::new(id, TaskControl::new(), move || {
            thread::sleep(Duration::from_millis(800));
            flag.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        thread::sleep(Duration::from_millis(50));

        pool.shutdown();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!pool.is_claimed(&id));
        assert_eq!(pool.status().claimed, 0);
    }

    #[test]
    fn dropped_claim_runs_release_callback() {
        let pool = pool(1);
        let id = Uuid::new_v4();
        pool.inner.lock().claimed.insert(id);
        let released = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&released);
        let claim = ClaimGuard {
            inner: Arc::clone(&pool.inner),
            id,
            on_release: Some(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        };
        drop(claim);
        assert!(!pool.is_claimed(&id));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_rejects_new_work_and_drops_queue() {
        let pool = pool(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.submit(Job::new(Uuid::new_v4(), TaskControl::new(), move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        }))
        .unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        pool.submit(Job::new(Uuid::new_v4(), TaskControl::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let _ = gate_tx.send(());
        });
        pool.shutdown();
        releaser.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(pool.status().shutdown);
        let err = pool
            .submit(Job::new(Uuid::new_v4(), TaskControl::new(), || {}))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }
}
