//! Fixed-size worker thread pool for per-frame callback dispatch.
//!
//! The capture dispatcher hands every locked frame to a [`WorkerPool`] and goes
//! straight back to waiting on the driver. The pool bounds how many user
//! callbacks run at once, which in turn bounds how many driver buffers can be
//! held locked at the same time.
//!
//! # Model
//!
//! 1. `N` named OS threads are started up front and live as long as the pool
//! 2. [`WorkerPool::execute`] pushes a task onto a FIFO queue and returns
//! 3. [`WorkerPool::wait_for_tasks`] blocks until the queue is empty *and* no
//!    task is running
//! 4. A panicking task is caught and counted; the worker keeps serving
//! 5. Dropping the pool drains the remaining queue, then joins every worker
//!
//! # Example
//!
//! ```
//! use capture_pool::WorkerPool;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pool = WorkerPool::new("frames", 4).unwrap();
//! let done = Arc::new(AtomicUsize::new(0));
//! for _ in 0..16 {
//!     let done = done.clone();
//!     pool.execute(move || {
//!         done.fetch_add(1, Ordering::SeqCst);
//!     });
//! }
//! pool.wait_for_tasks();
//! assert_eq!(done.load(Ordering::SeqCst), 16);
//! ```

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Boxed unit of work accepted by the pool.
type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: VecDeque<Task>,
    in_flight: usize,
    shutdown: bool,
}

struct Shared {
    name: String,
    state: Mutex<State>,
    /// Signalled when a task is queued or shutdown begins.
    task_ready: Condvar,
    /// Signalled when the pool becomes idle.
    idle: Condvar,
    panicked: AtomicU64,
}

/// Fixed-size pool of OS worker threads with fire-and-forget submission.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start a pool with `threads` workers (at least one).
    ///
    /// Worker threads are named `{name}-{index}`.
    pub fn new(name: impl Into<String>, threads: usize) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                in_flight: 0,
                shutdown: false,
            }),
            task_ready: Condvar::new(),
            idle: Condvar::new(),
            panicked: AtomicU64::new(0),
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(threads),
        };

        for index in 0..threads {
            let shared = pool.shared.clone();
            // On failure `pool` is dropped here, which joins the workers started so far.
            let handle = thread::Builder::new()
                .name(format!("{}-{}", pool.shared.name, index))
                .spawn(move || worker_loop(shared))?;
            pool.workers.push(handle);
        }

        debug!(pool = %pool.shared.name, threads, "Worker pool started");
        Ok(pool)
    }

    /// Queue a task and return immediately.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        state.queue.push_back(Box::new(task));
        drop(state);
        self.shared.task_ready.notify_one();
    }

    /// Block until every queued task has finished running.
    pub fn wait_for_tasks(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.in_flight > 0 {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Tasks waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    /// Tasks that panicked since the pool started.
    pub fn panicked_tasks(&self) -> u64 {
        self.shared.panicked.load(Ordering::Relaxed)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.task_ready.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(pool = %self.shared.name, "Worker thread terminated abnormally");
            }
        }
        debug!(pool = %self.shared.name, "Worker pool stopped");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("threads", &self.workers.len())
            .field("queued", &state.queue.len())
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    state.in_flight += 1;
                    break task;
                }
                // Queue is drained before honouring shutdown.
                if state.shutdown {
                    return;
                }
                shared.task_ready.wait(&mut state);
            }
        };

        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            warn!(pool = %shared.name, "Task panicked; worker continues");
        }

        let mut state = shared.state.lock();
        state.in_flight -= 1;
        if state.queue.is_empty() && state.in_flight == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_runs_all_tasks() {
        let pool = WorkerPool::new("test", 3).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.wait_for_tasks();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_zero_threads_clamped_to_one() {
        let pool = WorkerPool::new("test", 0).unwrap();
        assert_eq!(pool.thread_count(), 1);
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new("bounded", 2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let running = running.clone();
            let peak = peak.clone();
            pool.execute(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        pool.wait_for_tasks();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_wait_for_tasks_blocks_until_running_tasks_finish() {
        let pool = WorkerPool::new("wait", 2).unwrap();
        let gate = Arc::new(Barrier::new(2));
        let finished = Arc::new(AtomicUsize::new(0));

        {
            let gate = gate.clone();
            let finished = finished.clone();
            pool.execute(move || {
                gate.wait();
                thread::sleep(Duration::from_millis(20));
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Task is definitely running once the barrier releases.
        gate.wait();
        assert_eq!(pool.in_flight(), 1);
        pool.wait_for_tasks();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new("panic", 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.execute(|| panic!("boom"));
        {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.wait_for_tasks();
        assert_eq!(pool.panicked_tasks(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new("drain", 1).unwrap();
            for _ in 0..10 {
                let counter = counter.clone();
                pool.execute(move || {
                    thread::sleep(Duration::from_millis(1));
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
