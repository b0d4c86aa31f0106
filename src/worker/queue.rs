use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, error, info, warn};

use super::{WorkerQueueConfig, WorkerStatus};
use crate::utils::error::WorkerError;

/// Callback run by the workers for every task.
pub type TaskFn<T> = Arc<dyn Fn(T) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RunState {
    status: WorkerStatus,
    /// Stop flag of the current generation of workers.
    stop: Arc<AtomicBool>,
}

struct Shared<T> {
    name: String,
    callback: TaskFn<T>,
    receiver: Receiver<T>,
    run: Mutex<RunState>,
    last_activity: Mutex<Instant>,
    /// Tasks currently inside the callback.
    busy: AtomicUsize,
    idle_timeout: Duration,
    poll_interval: Duration,
}

impl<T> Shared<T> {
    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    fn is_idle(&self) -> bool {
        self.busy.load(Ordering::Acquire) == 0
            && self.receiver.is_empty()
            && self.idle_for() >= self.idle_timeout
    }

    /// Moves the pool to `Stopped` if `stop` still belongs to the running
    /// generation and the pool is still idle once the run lock is held.
    ///
    /// [`WorkerQueue::submit`] enqueues under the same lock, so a task is
    /// either seen here or finds the pool stopped and restarts it. A late
    /// worker from an older generation never stops a restarted pool.
    fn stop_if_idle(&self, stop: &Arc<AtomicBool>) -> bool {
        let mut run = lock(&self.run);
        if !Arc::ptr_eq(&run.stop, stop) || run.status != WorkerStatus::Running {
            return false;
        }
        if !self.is_idle() {
            return false;
        }
        stop.store(true, Ordering::Release);
        run.status = WorkerStatus::Stopped;
        true
    }
}

/// A pool of OS threads draining one shared FIFO of tasks.
///
/// Tasks can be added in any state; they wait in the queue until the pool
/// runs. The pool stops by itself when no task was taken for the idle
/// timeout and can be started again afterwards.
pub struct WorkerQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    sender: Sender<T>,
    workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerQueue<T> {
    pub fn new<F>(config: WorkerQueueConfig, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (sender, receiver) = unbounded();
        let stop = Arc::new(AtomicBool::new(true));
        Self {
            shared: Arc::new(Shared {
                name: config.name,
                callback: Arc::new(callback),
                receiver,
                run: Mutex::new(RunState {
                    status: WorkerStatus::Stopped,
                    stop,
                }),
                last_activity: Mutex::new(Instant::now()),
                busy: AtomicUsize::new(0),
                idle_timeout: config.idle_timeout,
                poll_interval: config.poll_interval,
            }),
            sender,
            workers: config.workers.max(1),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn status(&self) -> WorkerStatus {
        lock(&self.shared.run).status
    }

    pub fn is_running(&self) -> bool {
        self.status() == WorkerStatus::Running
    }

    /// Tasks waiting to be picked up.
    pub fn pending(&self) -> usize {
        self.shared.receiver.len()
    }

    /// Worker threads that have not exited yet.
    pub fn live_workers(&self) -> usize {
        lock(&self.handles).iter().filter(|h| !h.is_finished()).count()
    }

    /// Spawns the workers. Does nothing when the pool is already running.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut run = lock(&self.shared.run);
        self.start_locked(&mut run)
    }

    fn start_locked(&self, run: &mut RunState) -> Result<(), WorkerError> {
        if run.status == WorkerStatus::Running {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        self.shared.touch();

        let mut handles = lock(&self.handles);
        handles.retain(|handle| !handle.is_finished());
        for index in 0..self.workers {
            let shared = Arc::clone(&self.shared);
            let worker_stop = Arc::clone(&stop);
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", self.shared.name))
                .spawn(move || worker_loop(shared, worker_stop, index));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    stop.store(true, Ordering::Release);
                    error!(queue = %self.shared.name, error = %err, "failed to spawn worker");
                    return Err(err.into());
                }
            }
        }

        run.stop = stop;
        run.status = WorkerStatus::Running;
        info!(
            queue = %self.shared.name,
            workers = self.workers,
            pending = self.pending(),
            "worker queue started"
        );
        Ok(())
    }

    /// Asks the workers to exit once their current task is done.
    pub fn stop(&self) {
        let mut run = lock(&self.shared.run);
        run.stop.store(true, Ordering::Release);
        if run.status == WorkerStatus::Running {
            run.status = WorkerStatus::Stopped;
            info!(queue = %self.shared.name, "worker queue stopped");
        }
    }

    /// Queues `task` without changing the pool state. Never blocks.
    pub fn add_task(&self, task: T) {
        self.shared.touch();
        self.send(task);
    }

    /// Queues `task` and starts the pool if it is stopped, atomically with
    /// respect to the idle auto-stop. On a spawn failure the task stays
    /// queued for the next start.
    pub fn submit(&self, task: T) -> Result<(), WorkerError> {
        let mut run = lock(&self.shared.run);
        self.shared.touch();
        self.send(task);
        self.start_locked(&mut run)
    }

    fn send(&self, task: T) {
        // The receiver lives as long as `self`, so sending cannot fail.
        if self.sender.send(task).is_err() {
            warn!(queue = %self.shared.name, "task dropped, queue is disconnected");
        }
    }

    /// Blocks until every worker spawned so far has exited.
    pub fn join(&self) {
        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!(queue = %self.shared.name, "worker thread panicked");
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkerQueue<T> {
    fn drop(&mut self) {
        lock(&self.shared.run).stop.store(true, Ordering::Release);
    }
}

fn worker_loop<T>(shared: Arc<Shared<T>>, stop: Arc<AtomicBool>, index: usize) {
    debug!(queue = %shared.name, worker = index, "worker started");

    while !stop.load(Ordering::Acquire) {
        match shared.receiver.recv_timeout(shared.poll_interval) {
            Ok(task) => {
                shared.busy.fetch_add(1, Ordering::AcqRel);
                shared.touch();
                let callback: &(dyn Fn(T) + Send + Sync) = &*shared.callback;
                if catch_unwind(AssertUnwindSafe(|| callback(task))).is_err() {
                    error!(queue = %shared.name, worker = index, "task panicked, task lost");
                }
                shared.touch();
                shared.busy.fetch_sub(1, Ordering::AcqRel);
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.is_idle() && shared.stop_if_idle(&stop) {
                    info!(
                        queue = %shared.name,
                        idle_ms = shared.idle_for().as_millis() as u64,
                        "no tasks within idle timeout, worker queue stopped"
                    );
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(queue = %shared.name, worker = index, "worker exited");
}
