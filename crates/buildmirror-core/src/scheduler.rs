//! Delayed task execution with per-name de-duplication.
//!
//! A named task that is already pending is not scheduled a second time;
//! the name becomes free again the moment its task starts running.

use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

/// Work item run by a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Run `task` after `delay` unless a task named `name` is already
    /// pending. Returns whether `task` was accepted.
    fn schedule_named(&self, name: &str, delay: Duration, task: Task) -> bool;

    /// Run `task` once after `delay`.
    fn invoke_later(&self, delay: Duration, task: Task);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ThreadScheduler
// ---------------------------------------------------------------------------

struct Entry {
    name: Option<String>,
    task: Task,
}

#[derive(Default)]
struct Timeline {
    /// Keyed by due time, then submission order.
    due: BTreeMap<(Instant, u64), Entry>,
    pending_names: HashSet<String>,
    shutdown: bool,
}

struct Shared {
    timeline: Mutex<Timeline>,
    wakeup: Condvar,
    seq: AtomicU64,
}

/// Scheduler backed by a timer thread and a fixed pool of workers.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadScheduler {
    /// Start the timer thread and `workers` worker threads (at least one).
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned.
    pub fn start(workers: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            timeline: Mutex::new(Timeline::default()),
            wakeup: Condvar::new(),
            seq: AtomicU64::new(0),
        });
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));

        let mut threads = Vec::with_capacity(workers.max(1) + 1);
        for idx in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            threads.push(
                thread::Builder::new()
                    .name(format!("bmirror-worker-{idx}"))
                    .spawn(move || run_worker(&rx))?,
            );
        }
        let timer_shared = Arc::clone(&shared);
        threads.push(
            thread::Builder::new()
                .name("bmirror-timer".into())
                .spawn(move || run_timer(&timer_shared, &tx))?,
        );

        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Tasks accepted but not started yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.shared.timeline).due.len()
    }

    /// Drop pending tasks, let running ones finish, join every thread.
    pub fn shutdown(&self) {
        {
            let mut timeline = lock(&self.shared.timeline);
            timeline.shutdown = true;
            let dropped = timeline.due.len();
            timeline.due.clear();
            timeline.pending_names.clear();
            if dropped > 0 {
                debug!(dropped, "scheduler shutdown discarded pending tasks");
            }
        }
        self.shared.wakeup.notify_all();
        let handles = std::mem::take(&mut *lock(&self.threads));
        let current = thread::current().id();
        for handle in handles {
            // A worker can release the last handle to its own scheduler.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }
    }

    fn push(&self, name: Option<String>, delay: Duration, task: Task) -> bool {
        let mut timeline = lock(&self.shared.timeline);
        if timeline.shutdown {
            return false;
        }
        if let Some(name) = &name {
            if !timeline.pending_names.insert(name.clone()) {
                trace!(task = %name, "already pending");
                return false;
            }
        }
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        timeline
            .due
            .insert((Instant::now() + delay, seq), Entry { name, task });
        drop(timeline);
        self.shared.wakeup.notify_all();
        true
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_named(&self, name: &str, delay: Duration, task: Task) -> bool {
        self.push(Some(name.to_string()), delay, task)
    }

    fn invoke_later(&self, delay: Duration, task: Task) {
        self.push(None, delay, task);
    }
}

fn run_timer(shared: &Shared, tx: &Sender<Task>) {
    let mut timeline = lock(&shared.timeline);
    loop {
        if timeline.shutdown {
            return;
        }
        let now = Instant::now();
        let next_due = timeline.due.keys().next().map(|(at, _)| *at);
        match next_due {
            Some(at) if at <= now => {
                let Some((_, entry)) = timeline.due.pop_first() else {
                    continue;
                };
                if let Some(name) = &entry.name {
                    timeline.pending_names.remove(name);
                }
                if tx.send(entry.task).is_err() {
                    return;
                }
            }
            Some(at) => {
                timeline = shared
                    .wakeup
                    .wait_timeout(timeline, at - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            None => {
                timeline = shared
                    .wakeup
                    .wait(timeline)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

fn run_worker(rx: &Mutex<Receiver<Task>>) {
    loop {
        let next = lock(rx).recv();
        let Ok(task) = next else {
            return;
        };
        // A panicking task must not shrink the pool.
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("scheduled task panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// ManualScheduler
// ---------------------------------------------------------------------------

/// A task queued on a [`ManualScheduler`].
struct Queued {
    name: Option<String>,
    delay: Duration,
    task: Task,
}

/// Scheduler that runs nothing until asked to.
///
/// Used by tests and one-shot CLI runs. Delays only order execution.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<Vec<Queued>>,
}

impl ManualScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of pending named tasks, in queue order.
    #[must_use]
    pub fn pending_names(&self) -> Vec<String> {
        lock(&self.queue)
            .iter()
            .filter_map(|q| q.name.clone())
            .collect()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.queue).len()
    }

    #[must_use]
    pub fn is_pending(&self, name: &str) -> bool {
        lock(&self.queue)
            .iter()
            .any(|q| q.name.as_deref() == Some(name))
    }

    /// Run the tasks that are pending now, shortest delay first. Tasks they
    /// schedule stay queued for a later call. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        self.run_where(|_| true)
    }

    /// Like [`Self::run_pending`], restricted to named tasks whose name
    /// starts with `prefix`.
    pub fn run_named_with_prefix(&self, prefix: &str) -> usize {
        self.run_where(|q| q.name.as_deref().is_some_and(|n| n.starts_with(prefix)))
    }

    /// Repeat [`Self::run_pending`] until the queue is empty or `max_rounds`
    /// rounds ran. Returns how many tasks ran.
    pub fn run_until_idle(&self, max_rounds: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_rounds {
            let ran = self.run_pending();
            if ran == 0 {
                break;
            }
            total += ran;
        }
        total
    }

    fn run_where(&self, select: impl Fn(&Queued) -> bool) -> usize {
        let mut batch: Vec<Queued> = {
            let mut queue = lock(&self.queue);
            let (selected, kept): (Vec<Queued>, Vec<Queued>) =
                std::mem::take(&mut *queue).into_iter().partition(&select);
            *queue = kept;
            selected
        };
        batch.sort_by_key(|q| q.delay);
        let count = batch.len();
        for queued in batch {
            if let Some(name) = &queued.name {
                trace!(task = %name, "running");
            }
            (queued.task)();
        }
        count
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_named(&self, name: &str, delay: Duration, task: Task) -> bool {
        let mut queue = lock(&self.queue);
        if queue.iter().any(|q| q.name.as_deref() == Some(name)) {
            return false;
        }
        queue.push(Queued {
            name: Some(name.to_string()),
            delay,
            task,
        });
        true
    }

    fn invoke_later(&self, delay: Duration, task: Task) {
        lock(&self.queue).push(Queued {
            name: None,
            delay,
            task,
        });
    }
}
