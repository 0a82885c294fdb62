//! Task runtime: a small thread pool plus shareable task objects, so long
//! board operations (upload, reset, reboot) can run without blocking the
//! caller's event loop.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use log::warn;

use crate::error::Result;
use crate::message::{self, Message};
use crate::system::{adjust_timeout, millis};

/// Lifecycle of a task. Transitions are strictly forward:
/// Ready → Pending → Running → Finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskStatus {
    Ready,
    Pending,
    Running,
    Finished,
}

const DEFAULT_MAX_THREADS: usize = 16;
const DEFAULT_IDLE_TIMEOUT: i32 = 10000;

type TaskBody = Box<dyn FnOnce(&Task) -> Result<()> + Send>;
type TaskCallback = Arc<dyn Fn(&Message) + Send + Sync>;

struct TaskState {
    status: TaskStatus,
    body: Option<TaskBody>,
    outcome: Option<Result<()>>,
    result: Option<Box<dyn Any + Send>>,
    pool: Option<Pool>,
}

pub(crate) struct TaskShared {
    name: String,
    state: Mutex<TaskState>,
    cond: Condvar,
    callback: Mutex<Option<TaskCallback>>,
}

/// A unit of work that can be queued on a [Pool] and waited on from any
/// thread. Clones share the same underlying task.
#[derive(Clone)]
pub struct Task {
    shared: Arc<TaskShared>,
}

thread_local! {
    static CURRENT: RefCell<Option<Task>> = const { RefCell::new(None) };
}

/// Runs `f` with the task executing on this thread, if any.
pub(crate) fn with_current<R>(f: impl FnOnce(Option<&Task>) -> R) -> R {
    CURRENT.with(|current| f(current.borrow().as_ref()))
}

/// Waits on `cond` for up to `timeout` milliseconds (negative = forever).
/// Returns the reacquired guard and whether the wait timed out.
pub(crate) fn cond_wait<'a, T>(
    guard: MutexGuard<'a, T>,
    cond: &Condvar,
    timeout: i32,
) -> (MutexGuard<'a, T>, bool) {
    if timeout < 0 {
        (cond.wait(guard).unwrap(), false)
    } else {
        let (guard, result) = cond
            .wait_timeout(guard, Duration::from_millis(timeout as u64))
            .unwrap();
        (guard, result.timed_out())
    }
}

impl Task {
    pub(crate) fn new(
        name: impl Into<String>,
        body: impl FnOnce(&Task) -> Result<()> + Send + 'static,
    ) -> Task {
        Task {
            shared: Arc::new(TaskShared {
                name: name.into(),
                state: Mutex::new(TaskState {
                    status: TaskStatus::Ready,
                    body: Some(Box::new(body)),
                    outcome: None,
                    result: None,
                    pool: None,
                }),
                cond: Condvar::new(),
                callback: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.state.lock().unwrap().status
    }

    pub(crate) fn same_task(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<TaskShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(weak: &std::sync::Weak<TaskShared>) -> Option<Task> {
        weak.upgrade().map(|shared| Task { shared })
    }

    /// Installs a per-task message callback; every message emitted while
    /// this task runs (progress, logs, status changes) is copied to it.
    /// Only allowed before the task starts.
    pub fn set_callback(&self, f: impl Fn(&Message) + Send + Sync + 'static) {
        assert_eq!(self.status(), TaskStatus::Ready);
        *self.shared.callback.lock().unwrap() = Some(Arc::new(f));
    }

    /// Runs the task on `pool` instead of the process default.
    /// Only allowed before the task starts.
    pub fn set_pool(&self, pool: Pool) {
        assert_eq!(self.status(), TaskStatus::Ready);
        self.shared.state.lock().unwrap().pool = Some(pool);
    }

    pub(crate) fn deliver(&self, msg: &Message) {
        // Clone out of the lock: the callback itself may emit messages.
        let callback = self.shared.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(msg);
        }
    }

    fn change_status(&self, status: TaskStatus) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.status = status;
            self.shared.cond.notify_all();
        }

        message::emit_for(Some(self), &Message::Status(status));
    }

    /// Enqueues the task; it transitions to Pending now and to Running when
    /// a worker picks it up.
    pub fn start(&self) -> Result<()> {
        assert_eq!(self.status(), TaskStatus::Ready);

        let pool = {
            let mut state = self.shared.state.lock().unwrap();
            if state.pool.is_none() {
                state.pool = Some(default_pool().clone());
            }
            state.pool.clone().unwrap()
        };

        let mut ps = pool.shared.state.lock().unwrap();

        if ps.busy == ps.started && ps.started < ps.max_threads {
            pool.spawn_worker(&mut ps)?;
        }

        ps.queue.push_back(self.clone());
        pool.shared.cond.notify_one();

        // Publish and announce Pending before releasing the pool lock, so a
        // worker cannot report Running first.
        {
            let mut state = self.shared.state.lock().unwrap();
            state.status = TaskStatus::Pending;
            self.shared.cond.notify_all();
        }
        message::emit_for(Some(self), &Message::Status(TaskStatus::Pending));

        Ok(())
    }

    /// Blocks until the task reaches `status` (or further), or until the
    /// timeout elapses. Starting a Ready task is implied.
    ///
    /// As a latency optimization, waiting forever for Finished on a task no
    /// worker has picked up yet dequeues it and runs it right here.
    pub fn wait(&self, status: TaskStatus, timeout: i32) -> Result<bool> {
        assert!(status > TaskStatus::Ready);

        if status == TaskStatus::Finished && timeout < 0 {
            let pool = self.shared.state.lock().unwrap().pool.clone();
            if let Some(pool) = pool {
                let mut ps = pool.shared.state.lock().unwrap();
                let mut state = self.shared.state.lock().unwrap();
                if state.status == TaskStatus::Pending {
                    ps.queue.retain(|task| !task.same_task(self));
                    state.status = TaskStatus::Ready;
                }
            }

            if self.status() == TaskStatus::Ready {
                // Another waiter may have stolen the body already; run_now
                // is a no-op then and the condvar below picks up the slack.
                self.run_now();
            }
        } else if self.status() == TaskStatus::Ready {
            self.start()?;
        }

        let start = millis();
        let mut state = self.shared.state.lock().unwrap();
        while state.status < status {
            let (guard, timed_out) =
                cond_wait(state, &self.shared.cond, adjust_timeout(timeout, start));
            state = guard;
            if timed_out {
                break;
            }
        }

        Ok(state.status >= status)
    }

    /// Waits for the task to finish and returns its outcome.
    pub fn join(&self) -> Result<()> {
        self.wait(TaskStatus::Finished, -1)?;
        self.outcome().expect("finished task has an outcome")
    }

    /// The task's outcome, if it has finished.
    pub fn outcome(&self) -> Option<Result<()>> {
        self.shared.state.lock().unwrap().outcome.clone()
    }

    /// Stores a typed result for the caller to pick up after the task
    /// finishes.
    pub(crate) fn set_result<T: Any + Send>(&self, result: T) {
        self.shared.state.lock().unwrap().result = Some(Box::new(result));
    }

    /// Takes the typed result out of a finished task.
    pub fn take_result<T: Any + Send>(&self) -> Option<T> {
        let mut state = self.shared.state.lock().unwrap();
        assert_eq!(state.status, TaskStatus::Finished);

        match state.result.take() {
            Some(result) => match result.downcast::<T>() {
                Ok(result) => Some(*result),
                Err(result) => {
                    // Wrong type requested; put it back.
                    state.result = Some(result);
                    None
                }
            },
            None => None,
        }
    }

    /// Runs the task body synchronously on the current thread.
    pub(crate) fn run_now(&self) {
        let body = {
            let mut state = self.shared.state.lock().unwrap();
            state.body.take()
        };
        let Some(body) = body else {
            return;
        };

        let previous = CURRENT.with(|current| current.replace(Some(self.clone())));

        self.change_status(TaskStatus::Running);
        let outcome = body(self);
        self.shared.state.lock().unwrap().outcome = Some(outcome);
        self.change_status(TaskStatus::Finished);

        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .finish()
    }
}

struct PoolState {
    max_threads: usize,
    idle_timeout: i32,
    queue: VecDeque<Task>,
    started: usize,
    busy: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// A pool of worker threads. Workers are started on demand up to
/// `max_threads` and exit after `idle_timeout` without work.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Default for Pool {
    fn default() -> Self {
        Pool::new()
    }
}

impl Pool {
    pub fn new() -> Pool {
        Pool {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    max_threads: DEFAULT_MAX_THREADS,
                    idle_timeout: DEFAULT_IDLE_TIMEOUT,
                    queue: VecDeque::new(),
                    started: 0,
                    busy: 0,
                    shutdown: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn set_max_threads(&self, max: usize) {
        self.shared.state.lock().unwrap().max_threads = max.max(1);
    }

    pub fn max_threads(&self) -> usize {
        self.shared.state.lock().unwrap().max_threads
    }

    /// Idle time after which workers exit; negative keeps them forever.
    pub fn set_idle_timeout(&self, timeout: i32) {
        self.shared.state.lock().unwrap().idle_timeout = timeout;
    }

    pub fn idle_timeout(&self) -> i32 {
        self.shared.state.lock().unwrap().idle_timeout
    }

    fn spawn_worker(&self, ps: &mut PoolState) -> Result<()> {
        let pool = self.clone();

        let spawned = std::thread::Builder::new()
            .name("tyrs-worker".to_string())
            .spawn(move || worker_thread(pool));

        match spawned {
            Ok(_) => {
                ps.started += 1;
                ps.busy += 1;
                Ok(())
            }
            Err(err) => {
                warn!("failed to spawn pool worker: {}", err);
                Err(err.into())
            }
        }
    }
}

fn worker_thread(pool: Pool) {
    loop {
        let mut ps = pool.shared.state.lock().unwrap();
        ps.busy -= 1;

        let mut can_wait = true;
        let start = millis();
        let task = loop {
            if let Some(task) = ps.queue.pop_front() {
                break Some(task);
            }
            if ps.shutdown || !can_wait {
                break None;
            }

            let timeout = adjust_timeout(ps.idle_timeout, start);
            let (guard, timed_out) = cond_wait(ps, &pool.shared.cond, timeout);
            ps = guard;
            can_wait = !timed_out;
        };

        match task {
            Some(task) => {
                ps.busy += 1;
                drop(ps);

                task.run_now();
            }
            None => {
                ps.started -= 1;
                return;
            }
        }
    }
}

/// The process-wide pool board operations default to.
pub fn default_pool() -> &'static Pool {
    static DEFAULT: OnceLock<Pool> = OnceLock::new();
    DEFAULT.get_or_init(Pool::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn task_runs_through_the_pool_and_finishes() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);

        let task = Task::new("count", move |_| {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(task.status(), TaskStatus::Ready);
        task.start().unwrap();
        assert!(task.wait(TaskStatus::Finished, 5000).unwrap());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(task.outcome().unwrap().is_ok());
    }

    #[test]
    fn wait_on_a_ready_task_starts_it() {
        let task = Task::new("auto-start", |_| Ok(()));
        assert!(task.wait(TaskStatus::Finished, 5000).unwrap());
    }

    #[test]
    fn infinite_finish_wait_runs_synchronously() {
        let worker_thread_id = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&worker_thread_id);

        // A pool with no room so the task stays Pending.
        let pool = Pool::new();
        pool.shared.state.lock().unwrap().started = 1;
        pool.shared.state.lock().unwrap().busy = 0;
        pool.shared.state.lock().unwrap().max_threads = 1;

        let task = Task::new("sync-run", move |_| {
            *seen.lock().unwrap() = Some(std::thread::current().id());
            Ok(())
        });
        task.set_pool(pool);
        task.start().unwrap();

        assert!(task.wait(TaskStatus::Finished, -1).unwrap());
        assert_eq!(
            *worker_thread_id.lock().unwrap(),
            Some(std::thread::current().id())
        );
    }

    #[test]
    fn results_can_be_taken_once() {
        let task = Task::new("result", |task| {
            task.set_result(41usize + 1);
            Ok(())
        });
        task.join().unwrap();

        assert_eq!(task.take_result::<usize>(), Some(42));
        assert_eq!(task.take_result::<usize>(), None);
    }

    #[test]
    fn status_transitions_reach_the_task_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let task = Task::new("transitions", |_| Ok(()));
        task.set_callback(move |msg| {
            if let Message::Status(status) = msg {
                sink.lock().unwrap().push(*status);
            }
        });

        task.start().unwrap();
        task.wait(TaskStatus::Finished, 5000).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Finished]
        );
    }

    #[test]
    fn failed_tasks_report_their_error() {
        use crate::error::{Error, ErrorKind};

        let task = Task::new("failing", |_| {
            Err(Error::new(ErrorKind::Io, "it broke"))
        });
        let err = task.join().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
