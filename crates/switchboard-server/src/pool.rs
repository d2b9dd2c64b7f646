//! Fixed-size worker pool.
//!
//! A FIFO queue of boxed closures guarded by a mutex, with a condition
//! variable to park idle workers. Every worker runs the same loop:
//!
//! ```text
//! lock ─> pop front ─> unlock ─> run task ─> repeat
//!           │ empty
//!           └─> stopped? exit : wait on condvar
//! ```
//!
//! Shutdown stops intake, lets workers drain whatever is still queued, then
//! joins them. A panicking task is caught and reported through its
//! [`TaskHandle`]; the worker survives.

use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};

use crate::error::PoolError;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    stopped: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Completion handle for a submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    outcome: mpsc::Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes and return its result.
    ///
    /// # Errors
    ///
    /// - `PoolError::TaskPanicked` if the task panicked
    /// - `PoolError::ShutDown` if the task was dropped without running
    pub fn join(self) -> Result<T, PoolError> {
        match self.outcome.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(PoolError::TaskPanicked(panic_message(&*payload))),
            Err(_) => Err(PoolError::ShutDown),
        }
    }
}

/// Fixed set of named worker threads consuming a shared FIFO queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Start `threads` workers.
    ///
    /// # Errors
    ///
    /// - `PoolError::NoWorkers` if `threads` is zero
    /// - `PoolError::Spawn` if a thread could not be started; workers that
    ///   did start are stopped again
    pub fn new(threads: usize) -> Result<Self, PoolError> {
        if threads == 0 {
            return Err(PoolError::NoWorkers);
        }

        let pool = Self {
            shared: Arc::new(Shared::default()),
            workers: Mutex::new(Vec::with_capacity(threads)),
            size: threads,
        };

        for index in 0..threads {
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("switchboard-worker-{index}"))
                .spawn(move || work(&shared));

            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(PoolError::Spawn(e.to_string()));
                },
            }
        }

        tracing::debug!(threads, "Worker pool started");
        Ok(pool)
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Queue `task` and wake one idle worker.
    ///
    /// # Errors
    ///
    /// - `PoolError::ShutDown` after [`WorkerPool::shutdown`]
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let job: Task = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task));
            if let Err(payload) = &outcome {
                tracing::error!(panic = %panic_message(&**payload), "Worker task panicked");
            }
            // Nobody may be waiting on the handle.
            let _ = tx.send(outcome);
        });

        {
            let mut queue = self.shared.queue.lock();
            if queue.stopped {
                return Err(PoolError::ShutDown);
            }
            queue.tasks.push_back(job);
        }
        self.shared.available.notify_one();

        Ok(TaskHandle { outcome: rx })
    }

    /// Stop accepting tasks, run everything already queued, join all workers.
    ///
    /// Idempotent. Must not be called from a worker thread.
    pub fn shutdown(&self) {
        self.shared.queue.lock().stopped = true;
        self.shared.available.notify_all();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return;
        }

        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("Worker thread exited abnormally");
            }
        }
        tracing::debug!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if queue.stopped {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        task();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
