//! Fixed-size worker pool that executes actor runs.
//!
//! Jobs are distributed over a crossbeam channel to exactly `size` OS
//! threads. Submitting never blocks: the queue is unbounded, so a saturated
//! pool simply queues runs until a worker frees up.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

/// A unit of work executed by a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads.
pub struct WorkerPool {
    size: usize,
    tx: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start a pool with `size` worker threads named `{name}-{index}`.
    ///
    /// If `size` is 0, defaults to the number of available CPU cores.
    pub fn new(size: usize, name: &str) -> Self {
        let size = if size == 0 {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            size
        };

        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let rx = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(rx));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(error = %e, "failed to spawn worker thread"),
            }
        }

        WorkerPool {
            size,
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
        }
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. Returns `false` if the pool has been shut down.
    pub fn submit(&self, job: Job) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    /// Stop accepting jobs, let queued jobs drain, and join the workers.
    ///
    /// Safe to call from a worker thread: that thread is detached instead
    /// of joined.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        let current = thread::current().id();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }

    /// Whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn worker_loop(rx: Receiver<Job>) {
    for job in rx.iter() {
        // Dispatch already isolates handler panics; this keeps the worker
        // alive if a raw job panics.
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("job panicked on worker thread");
        }
    }
    debug!("worker exiting");
}
