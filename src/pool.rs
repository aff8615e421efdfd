//! Task transport and the worker pool.
//!
//! Tasks flow to N worker threads over a crossbeam channel; each produces
//! exactly one [`TaskResult`] on the result channel. The coordinator drains
//! results, runs the caller's callback (which may submit follow-up tasks)
//! and tracks an outstanding counter: +1 per submit, -1 per result. The run
//! is done when the counter reaches zero. With `process_num == 1` an inline
//! queue executes tasks on the calling thread for deterministic ordering.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, warn};

use crate::report::{Report, Reports};

/// One unit of work: process `path` at `depth` under the original `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub root: PathBuf,
    pub path: PathBuf,
    pub depth: usize,
}

/// Everything a worker produced for one task, shipped whole back to the
/// coordinator.
#[derive(Debug)]
pub struct TaskResult {
    task: Task,
    reports: Reports,
    new_tasks: Vec<Task>,
    incomplete: bool,
}

impl TaskResult {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            reports: Reports::new(),
            new_tasks: Vec::new(),
            incomplete: false,
        }
    }

    pub fn add_report(&mut self, report: Report) {
        self.reports.append(report);
    }

    pub fn add_new_task(&mut self, task: Task) {
        self.new_tasks.push(task);
    }

    pub fn mark_incomplete(&mut self) {
        self.incomplete = true;
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn reports(&self) -> &Reports {
        &self.reports
    }

    pub fn new_tasks(&self) -> &[Task] {
        &self.new_tasks
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn into_parts(self) -> (Task, Reports, Vec<Task>) {
        (self.task, self.reports, self.new_tasks)
    }
}

pub type TaskHandler = Arc<dyn Fn(Task) -> TaskResult + Send + Sync>;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A panicking task must still produce a result or the outstanding counter
/// never drains.
fn run_task(handler: &TaskHandler, task: Task) -> TaskResult {
    let task_copy = task.clone();
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (handler)(task))) {
        Ok(result) => result,
        Err(_) => {
            warn!("task panicked path={}", task_copy.path.display());
            let path = task_copy.path.clone();
            let mut result = TaskResult::new(task_copy);
            result.add_report(Report::unknown_error(&path, &"task panicked"));
            result
        }
    }
}

/// Build a pool; `process_num == 1` selects the inline variant.
pub fn make_pool(process_num: usize, handler: TaskHandler, cancel: Arc<AtomicBool>) -> TaskPool {
    if process_num <= 1 {
        TaskPool::Inline(InlinePool {
            queue: Mutex::new(VecDeque::new()),
            handler,
            cancel,
        })
    } else {
        TaskPool::Threaded(ThreadedPool::start(process_num, handler, cancel))
    }
}

pub enum TaskPool {
    Inline(InlinePool),
    Threaded(ThreadedPool),
}

impl TaskPool {
    /// Accepts new work at any time, including from inside the result
    /// callback. Tasks submitted after cancellation are dropped.
    pub fn submit(&self, task: Task) {
        match self {
            TaskPool::Inline(pool) => pool.submit(task),
            TaskPool::Threaded(pool) => pool.submit(task),
        }
    }

    /// Blocks until every submitted task has produced a result and the
    /// callback ran for it. The callback may call [`TaskPool::submit`].
    pub fn process_until_done(&self, mut callback: impl FnMut(&TaskPool, TaskResult)) {
        match self {
            TaskPool::Inline(pool) => loop {
                if pool.cancel.load(Ordering::Relaxed) {
                    debug!("cancellation requested; dropping queued tasks");
                    pool.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
                    break;
                }
                let next = pool
                    .queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop_front();
                match next {
                    Some(task) => {
                        let result = run_task(&pool.handler, task);
                        callback(self, result);
                    }
                    None => break,
                }
            },
            TaskPool::Threaded(pool) => loop {
                if pool.outstanding.load(Ordering::Acquire) == 0 {
                    break;
                }
                match pool.result_rx.recv_timeout(RESULT_POLL_INTERVAL) {
                    Ok(result) => {
                        pool.outstanding.fetch_sub(1, Ordering::AcqRel);
                        callback(self, result);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("result channel closed with outstanding tasks");
                        break;
                    }
                }
            },
        }
    }
}

pub struct InlinePool {
    queue: Mutex<VecDeque<Task>>,
    handler: TaskHandler,
    cancel: Arc<AtomicBool>,
}

impl InlinePool {
    fn submit(&self, task: Task) {
        if self.cancel.load(Ordering::Relaxed) {
            debug!("pool cancelled; dropping task {}", task.path.display());
            return;
        }
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(task);
    }
}

pub struct ThreadedPool {
    task_tx: Option<Sender<Task>>,
    result_rx: Receiver<TaskResult>,
    outstanding: Arc<AtomicU64>,
    cancel: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadedPool {
    fn start(process_num: usize, handler: TaskHandler, cancel: Arc<AtomicBool>) -> Self {
        let (task_tx, task_rx) = unbounded::<Task>();
        let (result_tx, result_rx) = unbounded::<TaskResult>();

        let mut workers = Vec::with_capacity(process_num);
        for _ in 0..process_num {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let handler = Arc::clone(&handler);
            let cancel = Arc::clone(&cancel);
            workers.push(std::thread::spawn(move || {
                for task in task_rx.iter() {
                    // A task picked up after cancellation still returns a
                    // result so the outstanding counter stays balanced.
                    let result = if cancel.load(Ordering::Relaxed) {
                        let mut result = TaskResult::new(task);
                        result.mark_incomplete();
                        result
                    } else {
                        run_task(&handler, task)
                    };
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            }));
        }

        Self {
            task_tx: Some(task_tx),
            result_rx,
            outstanding: Arc::new(AtomicU64::new(0)),
            cancel,
            workers,
        }
    }

    fn submit(&self, task: Task) {
        if self.cancel.load(Ordering::Relaxed) {
            debug!("pool cancelled; dropping task {}", task.path.display());
            return;
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let Some(task_tx) = &self.task_tx else {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return;
        };
        if task_tx.send(task).is_err() {
            warn!("task channel closed; dropping task");
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for ThreadedPool {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops.
        self.task_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
