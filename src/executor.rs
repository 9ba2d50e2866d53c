//! Serializes every mutating collection operation through a single
//! dedicated worker thread, with a pre-load buffering mode so that
//! operations issued before the database finishes loading are queued and
//! replayed in order once it does.
//!
//! Grounded on `engine.rs`'s `mpsc::sync_channel` + background-thread
//! worker used for its full-text-index job queue — the same "hand work to
//! one consumer thread" shape, repurposed here as the sole mutator of
//! collection state rather than an auxiliary indexer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send>;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    pending: Mutex<VecDeque<Task>>,
    buffering: Mutex<bool>,
    cv: Condvar,
    shutdown: AtomicBool,
}

/// The serialized task queue. Exactly one task runs at a time, on a
/// dedicated worker thread, in the order tasks were admitted to the run
/// queue.
pub struct Executor {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Executor {
    /// Starts in the buffering state: tasks enqueued via [`Executor::enqueue`]
    /// accumulate until [`Executor::process_buffer`] is called.
    pub fn new_buffering() -> Self {
        Self::start(true)
    }

    /// Starts already running (for `in_memory_only` collections, which
    /// have no load phase to wait for).
    pub fn new_running() -> Self {
        Self::start(false)
    }

    fn start(buffering: bool) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(VecDeque::new()),
            buffering: Mutex::new(buffering),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || Self::run_worker(worker_shared));
        Self { shared, worker: Some(worker) }
    }

    fn run_worker(shared: Arc<Shared>) {
        loop {
            let mut queue = shared.queue.lock().expect("executor queue mutex poisoned");
            while queue.is_empty() && !shared.shutdown.load(Ordering::SeqCst) {
                queue = shared.cv.wait(queue).expect("executor queue mutex poisoned");
            }
            let task = queue.pop_front();
            let empty_and_shutdown = queue.is_empty() && shared.shutdown.load(Ordering::SeqCst);
            drop(queue);

            match task {
                Some(t) => t(),
                None if empty_and_shutdown => break,
                None => {}
            }
        }
    }

    fn push_run_queue(&self, task: Task) {
        let mut queue = self.shared.queue.lock().expect("executor queue mutex poisoned");
        queue.push_back(task);
        self.shared.cv.notify_one();
    }

    /// Enqueues a task for normal execution. While buffering, the task is
    /// held in the pending buffer instead of the run queue.
    pub fn enqueue<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let buffering = *self.shared.buffering.lock().expect("executor state mutex poisoned");
        if buffering {
            self.shared.pending.lock().expect("executor pending mutex poisoned").push_back(Box::new(f));
        } else {
            self.push_run_queue(Box::new(f));
        }
    }

    /// Enqueues a task that bypasses buffering entirely — used for the
    /// load task itself, which must run even while the executor is still
    /// in the buffering state.
    pub fn enqueue_now<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_run_queue(Box::new(f));
    }

    /// Runs `f` on the worker thread and blocks the caller for its result.
    /// If the executor is still buffering, this call blocks until
    /// [`Executor::process_buffer`] runs and this task's turn comes up.
    pub fn run_sync<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = channel();
        self.enqueue(move || {
            let _ = tx.send(f());
        });
        rx.recv().expect("executor task dropped without producing a result")
    }

    /// Like [`Executor::run_sync`] but bypasses buffering (for the load task).
    pub fn run_sync_now<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = channel();
        self.enqueue_now(move || {
            let _ = tx.send(f());
        });
        rx.recv().expect("executor task dropped without producing a result")
    }

    /// Transitions from buffering to running, moving every pending task
    /// onto the run queue in the order it was received.
    pub fn process_buffer(&self) {
        let mut buffering = self.shared.buffering.lock().expect("executor state mutex poisoned");
        *buffering = false;
        drop(buffering);

        let drained: Vec<Task> = self
            .shared
            .pending
            .lock()
            .expect("executor pending mutex poisoned")
            .drain(..)
            .collect();
        for t in drained {
            self.push_run_queue(t);
        }
    }

    pub fn is_buffering(&self) -> bool {
        *self.shared.buffering.lock().expect("executor state mutex poisoned")
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
