//! Fixed-size worker pool.
//!
//! Tasks go through an unbounded flume channel: concurrency is bounded by
//! the number of workers, backpressure shows up as queue growth, never as
//! rejection.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::common::config::{MAX_THREAD_POOL_TASK_NUM, MIN_THREAD_POOL_TASK_NUM};
use crate::common::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queued plus running task count, for [`WorkerPool::wait_idle`].
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct WorkerPool {
    sender: Mutex<Option<flume::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<Pending>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers named `purgeable-worker-<n>`.
    ///
    /// A size outside the accepted range is rejected; a pool without
    /// workers would queue tasks forever.
    pub fn new(size: usize) -> Result<Self> {
        if !(MIN_THREAD_POOL_TASK_NUM..=MAX_THREAD_POOL_TASK_NUM).contains(&size) {
            return Err(Error::InvalidPoolSize {
                size,
                min: MIN_THREAD_POOL_TASK_NUM,
                max: MAX_THREAD_POOL_TASK_NUM,
            });
        }
        let (tx, rx) = flume::unbounded::<Task>();
        let pending = Arc::new(Pending::default());
        let mut workers = Vec::with_capacity(size);

        for i in 0..size {
            let rx = rx.clone();
            let pending = Arc::clone(&pending);
            let handle = std::thread::Builder::new()
                .name(format!("purgeable-worker-{i}"))
                .spawn(move || {
                    debug!(worker = i, "worker started");
                    while let Ok(task) = rx.recv() {
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            error!(worker = i, "task panicked");
                        }
                        pending.done();
                    }
                    debug!(worker = i, "worker stopped");
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            pending,
            size,
        })
    }

    /// Queue `task`. Returns `false` once the pool has been shut down.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return false;
        };
        self.pending.add();
        if tx.send(Box::new(task)).is_err() {
            self.pending.done();
            return false;
        }
        true
    }

    /// Block until every queued task has finished.
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }

    /// Stop accepting tasks, drain the queue and join the workers.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = std::thread::current().id();
        for handle in workers {
            // A task dropping the last reference to the pool runs on a worker.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks queued or running.
    pub fn pending(&self) -> usize {
        *self.pending.count.lock()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
