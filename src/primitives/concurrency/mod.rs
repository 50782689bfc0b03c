#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{CacheError, Result};

/// Unit of work executed by the [`WorkerPool`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of OS threads draining a shared FIFO queue.
///
/// Jobs already queued when [`WorkerPool::shutdown`] is called still run;
/// submissions after that point fail with [`CacheError::Closed`].
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolShared {
    name: String,
    state: Mutex<PoolState>,
    wakeup: Condvar,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    active: usize,
    shutting_down: bool,
}

impl WorkerPool {
    /// Spawns `threads` workers (at least one).
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            name: name.to_string(),
            state: Mutex::new(PoolState::default()),
            wakeup: Condvar::new(),
        });
        let threads = threads.max(1);
        let mut handles = Vec::with_capacity(threads);
        for idx in 0..threads {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || Self::worker_loop(worker_shared))
                .map_err(CacheError::from)?;
            handles.push(handle);
        }
        debug!(pool = name, threads, "pool.start");
        Ok(Self {
            shared,
            handles: Mutex::new(handles),
        })
    }

    /// Queues `job` for execution on some worker.
    pub fn submit(&self, job: Job) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return Err(CacheError::Closed);
        }
        state.queue.push_back(job);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Queues `job`, or runs it on the calling thread once the pool is
    /// shutting down.
    pub fn submit_or_run(&self, job: Job) {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            drop(state);
            job();
            return;
        }
        state.queue.push_back(job);
        self.shared.wakeup.notify_one();
    }

    /// Number of jobs queued or running.
    pub fn pending(&self) -> usize {
        let state = self.shared.state.lock();
        state.queue.len() + state.active
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.handles.lock().len()
    }

    /// Stops accepting jobs, lets workers drain the queue and joins them.
    ///
    /// Safe to call from a worker thread; that worker is detached instead of
    /// joined.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutting_down && self.handles.lock().is_empty() {
                return;
            }
            state.shutting_down = true;
            self.shared.wakeup.notify_all();
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.shared.name, "pool.join_failed");
            }
        }
        debug!(pool = %self.shared.name, "pool.stopped");
    }

    fn worker_loop(shared: Arc<PoolShared>) {
        loop {
            let job = {
                let mut state = shared.state.lock();
                loop {
                    if let Some(job) = state.queue.pop_front() {
                        state.active += 1;
                        break Some(job);
                    }
                    if state.shutting_down {
                        break None;
                    }
                    shared.wakeup.wait(&mut state);
                }
            };
            let Some(job) = job else {
                break;
            };
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!(pool = %shared.name, "pool.job_panicked");
            }
            shared.state.lock().active -= 1;
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Counts in-flight background jobs belonging to one owner so the owner can
/// wait for them before tearing down state they reference.
#[derive(Default)]
pub struct BackgroundJobs {
    state: Mutex<JobsState>,
    idle: Condvar,
}

#[derive(Default)]
struct JobsState {
    running: usize,
    closing: bool,
}

/// Registration of one in-flight job; dropping it marks the job finished.
pub struct JobTicket {
    jobs: Arc<BackgroundJobs>,
}

impl BackgroundJobs {
    /// Creates an empty tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a job, failing once the tracker is closing.
    pub fn add(self: &Arc<Self>) -> Result<JobTicket> {
        let mut state = self.state.lock();
        if state.closing {
            return Err(CacheError::Closed);
        }
        state.running += 1;
        Ok(JobTicket {
            jobs: Arc::clone(self),
        })
    }

    /// Number of registered jobs that have not finished.
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Blocks until no job is running. New jobs may still be added.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.running > 0 {
            self.idle.wait(&mut state);
        }
    }

    /// Refuses further jobs and waits for the running ones.
    pub fn close_and_wait(&self) {
        let mut state = self.state.lock();
        state.closing = true;
        while state.running > 0 {
            self.idle.wait(&mut state);
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.running -= 1;
        if state.running == 0 {
            self.idle.notify_all();
        }
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        self.jobs.finish();
    }
}
