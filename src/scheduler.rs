/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The work-stealing scheduler.
//!
//! A pool of OS-thread workers drives [`Resumable`] jobs to completion.
//! Each worker owns a private LIFO stack of jobs it generated itself
//! and an exposed MPMC queue that receives external enqueues and from
//! which other workers may steal. Stealing is rare in practice, so the
//! non-stealing path stays lock-free and allocation-free.
//!
//! A parked actor is not requeued by the worker that parked it; the
//! producer that flips its mailbox back to active resubmits it. This
//! keeps each runnable job in exactly one queue at a time.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;

/// The outcome of one resume slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resumption {
    /// The job is finished and must not run again.
    Done,
    /// The job parked itself; whoever wakes it resubmits it.
    ResumeLater,
    /// The worker that executed this job must shut down.
    Shutdown,
}

/// A schedulable unit of work.
pub trait Resumable: Send + Sync {
    /// Run until parked, finished, or told to shut down.
    fn resume(&self, worker: &Worker) -> Resumption;
}

/// A shared handle to a resumable job.
pub type Job = Arc<dyn Resumable>;

struct ShutdownJob;

impl Resumable for ShutdownJob {
    fn resume(&self, _worker: &Worker) -> Resumption {
        Resumption::Shutdown
    }
}

struct WorkerShared {
    /// Exposed to external enqueues and to stealing workers.
    exposed: SegQueue<Job>,
}

struct SchedulerState {
    workers: Vec<WorkerShared>,
    next_worker: AtomicUsize,
}

/// The execution context handed to jobs while they run. Jobs use it to
/// schedule follow-up work onto the worker that is executing them.
pub struct Worker {
    id: usize,
    state: Arc<SchedulerState>,
    /// Private job stack; only this worker touches it.
    private: Mutex<Vec<Job>>,
    last_victim: Cell<usize>,
}

// Upper bound for the idle sleep once spinning stops paying off.
const IDLE_SLEEP: Duration = Duration::from_micros(500);

impl Worker {
    /// Enqueue a job generated while executing on this worker. Runs
    /// before anything that could be stolen, preserving locality.
    pub fn exec_later(&self, job: Job) {
        self.private.lock().push(job);
    }

    /// The worker's index within the pool.
    pub fn id(&self) -> usize {
        self.id
    }

    fn next_job(&self, backoff: &Backoff) -> Job {
        loop {
            if let Some(job) = self.private.lock().pop() {
                backoff.reset();
                return job;
            }
            if let Some(job) = self.state.workers[self.id].exposed.pop() {
                backoff.reset();
                return job;
            }
            if let Some(job) = self.raid() {
                backoff.reset();
                return job;
            }
            if backoff.is_completed() {
                thread::sleep(IDLE_SLEEP);
            } else {
                backoff.snooze();
            }
        }
    }

    /// One steal sweep over the other workers, starting after the last
    /// successful victim.
    fn raid(&self) -> Option<Job> {
        let n = self.state.workers.len();
        if n < 2 {
            return None;
        }
        let start = self.last_victim.get();
        for i in 1..n {
            let victim = (start + i) % n;
            if victim == self.id {
                continue;
            }
            if let Some(job) = self.state.workers[victim].exposed.pop() {
                self.last_victim.set(victim);
                return Some(job);
            }
        }
        None
    }

    fn run(self) {
        let backoff = Backoff::new();
        loop {
            let job = self.next_job(&backoff);
            if job.resume(&self) == Resumption::Shutdown {
                break;
            }
        }
        // Drain whatever is still queued locally so no ready job is
        // silently dropped during shutdown.
        loop {
            let job = {
                let mut private = self.private.lock();
                private.pop()
            };
            let job = match job {
                Some(job) => job,
                None => match self.state.workers[self.id].exposed.pop() {
                    Some(job) => job,
                    None => break,
                },
            };
            job.resume(&self);
        }
    }
}

/// The worker pool.
pub struct Scheduler {
    state: Arc<SchedulerState>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Start a pool with `workers` threads; `None` uses the hardware
    /// concurrency.
    pub fn start(workers: Option<usize>) -> Self {
        let n = workers
            .unwrap_or_else(|| thread::available_parallelism().map_or(4, |p| p.get()))
            .max(1);
        let state = Arc::new(SchedulerState {
            workers: (0..n)
                .map(|_| WorkerShared {
                    exposed: SegQueue::new(),
                })
                .collect(),
            next_worker: AtomicUsize::new(0),
        });
        let threads = (0..n)
            .map(|id| {
                let worker = Worker {
                    id,
                    state: Arc::clone(&state),
                    private: Mutex::new(Vec::new()),
                    last_victim: Cell::new(id),
                };
                thread::Builder::new()
                    .name(format!("spindle-worker-{}", id))
                    .spawn(move || worker.run())
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            state,
            threads: Mutex::new(threads),
        }
    }

    /// Enqueue a job from outside the pool. Jobs are spread round-robin
    /// over the workers' exposed queues.
    pub fn enqueue(&self, job: Job) {
        let n = self.state.workers.len();
        let idx = self.state.next_worker.fetch_add(1, Ordering::Relaxed) % n;
        self.state.workers[idx].exposed.push(job);
    }

    /// The number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.state.workers.len()
    }

    /// Post one shutdown sentinel per worker and join the pool.
    /// Idempotent.
    pub fn shutdown(&self) {
        let mut threads = self.threads.lock();
        if threads.is_empty() {
            return;
        }
        for worker in &self.state.workers {
            worker.exposed.push(Arc::new(ShutdownJob));
        }
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
