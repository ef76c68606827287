//! Worker pool of short cooperative tasks. A task runs to completion, then
//! says when it wants to run again; anyone holding its [`TaskHandle`] can
//! wake it earlier.

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Run again after the delay (or earlier if woken).
    Reschedule(Duration),
    /// Sleep until woken.
    Snooze,
    /// Remove the task from the pool.
    Done,
}

pub trait Task: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self) -> TaskStatus;
}

struct TaskEntry {
    task: Arc<dyn Task>,
    wake_at: Option<Instant>,
    running: bool,
    woken_while_running: bool,
    cancelled: bool,
}

#[derive(Default)]
struct PoolState {
    tasks: HashMap<TaskId, TaskEntry>,
    next_id: TaskId,
    shutdown: bool,
}

impl PoolState {
    /// Ready task with the earliest wake time.
    fn next_ready(&self, now: Instant) -> Option<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, entry)| !entry.running && entry.wake_at.is_some_and(|at| at <= now))
            .min_by_key(|(id, entry)| (entry.wake_at, **id))
            .map(|(id, _)| *id)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.tasks
            .values()
            .filter(|entry| !entry.running)
            .filter_map(|entry| entry.wake_at)
            .min()
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    ready: Condvar,
}

impl PoolInner {
    fn take_ready(&self, id: TaskId) -> Option<Arc<dyn Task>> {
        let mut state = self.state.lock();
        let entry = state.tasks.get_mut(&id)?;
        entry.running = true;
        entry.woken_while_running = false;
        Some(Arc::clone(&entry.task))
    }

    fn run_task(&self, id: TaskId, task: &Arc<dyn Task>) {
        let status = match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            Ok(status) => status,
            Err(_) => {
                warn!("event=executor_task_panicked task={} id={}", task.name(), id);
                TaskStatus::Done
            }
        };
        self.finish(id, status);
    }

    fn finish(&self, id: TaskId, status: TaskStatus) {
        let mut state = self.state.lock();
        let remove = match state.tasks.get_mut(&id) {
            Some(entry) => {
                entry.running = false;
                if entry.cancelled || status == TaskStatus::Done {
                    true
                } else {
                    entry.wake_at = if entry.woken_while_running {
                        Some(Instant::now())
                    } else {
                        match status {
                            TaskStatus::Reschedule(delay) => Some(Instant::now() + delay),
                            _ => None,
                        }
                    };
                    false
                }
            }
            None => false,
        };
        if remove {
            state.tasks.remove(&id);
        }
        drop(state);
        self.ready.notify_one();
    }

    fn wake(&self, id: TaskId, at: Instant) {
        let mut state = self.state.lock();
        if let Some(entry) = state.tasks.get_mut(&id) {
            if entry.running {
                entry.woken_while_running = true;
            } else {
                entry.wake_at = Some(entry.wake_at.map_or(at, |current| current.min(at)));
            }
        }
        drop(state);
        self.ready.notify_one();
    }

    fn snooze(&self, id: TaskId, delay: Duration) {
        let mut state = self.state.lock();
        if let Some(entry) = state.tasks.get_mut(&id) {
            if !entry.running {
                entry.wake_at = Some(Instant::now() + delay);
            }
        }
    }

    fn cancel(&self, id: TaskId) {
        let mut state = self.state.lock();
        let remove = match state.tasks.get_mut(&id) {
            Some(entry) if entry.running => {
                entry.cancelled = true;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            state.tasks.remove(&id);
        }
    }

    fn schedule(inner: &Arc<PoolInner>, task: Arc<dyn Task>, at: Instant) -> TaskHandle {
        let mut state = inner.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        debug!("event=executor_task_scheduled task={} id={}", task.name(), id);
        state.tasks.insert(
            id,
            TaskEntry {
                task,
                wake_at: Some(at),
                running: false,
                woken_while_running: false,
                cancelled: false,
            },
        );
        drop(state);
        inner.ready.notify_one();
        TaskHandle {
            id,
            pool: Arc::downgrade(inner),
        }
    }
}

/// Wake/snooze/cancel handle for a scheduled task. Outlives the pool safely.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    pool: Weak<PoolInner>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Makes the task runnable now. Repeated wakes coalesce.
    pub fn wake(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.wake(self.id, Instant::now());
        }
    }

    pub fn snooze(&self, delay: Duration) {
        if let Some(pool) = self.pool.upgrade() {
            pool.snooze(self.id, delay);
        }
    }

    pub fn cancel(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.cancel(self.id);
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

/// Cheap handle for scheduling from inside tasks without owning the pool.
#[derive(Clone)]
pub struct Spawner {
    pool: Weak<PoolInner>,
}

impl Spawner {
    pub fn schedule(&self, task: Arc<dyn Task>) -> Option<TaskHandle> {
        self.pool
            .upgrade()
            .map(|pool| PoolInner::schedule(&pool, task, Instant::now()))
    }
}

pub struct ExecutorPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutorPool {
    /// A pool with `threads` workers. Zero workers gives a manual pool that
    /// only runs tasks from [`ExecutorPool::run_ready`].
    pub fn new(threads: usize) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState::default()),
            ready: Condvar::new(),
        });
        let workers = (0..threads)
            .map(|index| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("kvshard-worker-{index}"))
                    .spawn(move || worker_loop(inner))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!("event=executor_worker_spawn_failed error={}", err);
                    None
                }
            })
            .collect();
        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    pub fn manual() -> Self {
        Self::new(0)
    }

    pub fn schedule(&self, task: Arc<dyn Task>) -> TaskHandle {
        PoolInner::schedule(&self.inner, task, Instant::now())
    }

    pub fn schedule_after(&self, task: Arc<dyn Task>, delay: Duration) -> TaskHandle {
        PoolInner::schedule(&self.inner, task, Instant::now() + delay)
    }

    pub fn spawner(&self) -> Spawner {
        Spawner {
            pool: Arc::downgrade(&self.inner),
        }
    }

    pub fn num_tasks(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Runs, on the calling thread, every task that is due now. Tasks made
    /// ready by these runs wait for the next call. Returns how many ran.
    pub fn run_ready(&self) -> usize {
        let now = Instant::now();
        let due: Vec<TaskId> = {
            let state = self.inner.state.lock();
            let mut due: Vec<(Option<Instant>, TaskId)> = state
                .tasks
                .iter()
                .filter(|(_, entry)| !entry.running && entry.wake_at.is_some_and(|at| at <= now))
                .map(|(id, entry)| (entry.wake_at, *id))
                .collect();
            due.sort();
            due.into_iter().map(|(_, id)| id).collect()
        };
        let mut ran = 0;
        for id in due {
            if let Some(task) = self.inner.take_ready(id) {
                self.inner.run_task(id, &task);
                ran += 1;
            }
        }
        ran
    }

    /// Stops the workers and drops every task. Running tasks finish first.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.inner.ready.notify_all();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("event=executor_worker_join_failed");
            }
        }
        self.inner.state.lock().tasks.clear();
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let id = {
            let mut state = inner.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                let now = Instant::now();
                if let Some(id) = state.next_ready(now) {
                    break id;
                }
                match state.next_deadline() {
                    Some(deadline) => {
                        inner.ready.wait_until(&mut state, deadline);
                    }
                    None => inner.ready.wait(&mut state),
                }
            }
        };
        if let Some(task) = inner.take_ready(id) {
            inner.run_task(id, &task);
        }
    }
}
