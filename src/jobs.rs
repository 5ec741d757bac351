//! Background job queue.
//!
//! A fixed pool of worker threads drains a shared deque. Jobs run to
//! completion once started; there is no preemption and no priority. The
//! queue is an explicit instance owned by whoever needs it (typically the
//! frame driver for parallel command recording), not a process-wide
//! singleton.
//!
//! Shutdown is cooperative: dropping the queue sets the stop flag, wakes
//! every worker, and joins them. Jobs still in the deque at that point are
//! discarded; a job already running finishes first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::sync::Fence;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle state of one worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Parked, waiting for work.
    Idle,
    /// Executing a job.
    Running,
    /// Stop flag observed, draining out.
    Stopping,
}

struct QueuedJob {
    job: Job,
    done: Fence,
}

struct Shared {
    queue: Mutex<VecDeque<QueuedJob>>,
    condvar: Condvar,
    stop: AtomicBool,
}

/// Completion handle for a submitted job.
///
/// `wait` blocks until the job has finished running. Dropping the handle
/// without waiting is fine; the job still runs.
#[derive(Clone)]
pub struct JobHandle {
    done: Fence,
}

impl JobHandle {
    /// Block until the job has completed.
    pub fn wait(&self) {
        self.done.wait();
    }

    pub fn is_done(&self) -> bool {
        self.done.is_signaled()
    }
}

/// A fixed-size pool of worker threads draining a FIFO job deque.
pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    states: Vec<Arc<Mutex<WorkerState>>>,
}

impl JobQueue {
    /// Spawn a queue with the given number of worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` is zero.
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "job queue needs at least one worker");

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(worker_count);
        let mut states = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let state = Arc::new(Mutex::new(WorkerState::Idle));
            let thread_shared = Arc::clone(&shared);
            let thread_state = Arc::clone(&state);
            let handle = std::thread::Builder::new()
                .name(format!("job-worker-{index}"))
                .spawn(move || worker_loop(thread_shared, thread_state))
                .unwrap_or_else(|e| panic!("failed to spawn job worker {index}: {e}"));
            workers.push(handle);
            states.push(state);
        }

        log::trace!("JobQueue: started {worker_count} workers");
        Self {
            shared,
            workers,
            states,
        }
    }

    /// Enqueue a job and return its completion handle.
    pub fn push<F>(&self, job: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let done = Fence::new();
        let handle = JobHandle { done: done.clone() };
        self.shared.queue.lock().push_back(QueuedJob {
            job: Box::new(job),
            done,
        });
        self.shared.condvar.notify_one();
        handle
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of jobs queued but not yet picked up by a worker.
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Snapshot of every worker's state.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.states.iter().map(|s| *s.lock()).collect()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.condvar.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        log::trace!("JobQueue: all workers joined");
    }
}

fn worker_loop(shared: Arc<Shared>, state: Arc<Mutex<WorkerState>>) {
    loop {
        let queued = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.stop.load(Ordering::SeqCst) {
                    break None;
                }
                shared.condvar.wait(&mut queue);
            }
        };

        match queued {
            Some(queued) => {
                *state.lock() = WorkerState::Running;
                (queued.job)();
                // Back to idle before the completion signal, so a waiter
                // never observes a stale Running.
                *state.lock() = WorkerState::Idle;
                queued.done.signal();
            }
            None => {
                *state.lock() = WorkerState::Stopping;
                return;
            }
        }
    }
}

static_assertions::assert_impl_all!(JobQueue: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_jobs_run_to_completion() {
        let queue = JobQueue::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let counter = Arc::clone(&counter);
                queue.push(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in &handles {
            handle.wait();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 16);
        assert!(handles.iter().all(|h| h.is_done()));
    }

    #[test]
    fn test_wait_blocks_until_done() {
        let queue = JobQueue::new(1);
        let flag = Arc::new(AtomicBool::new(false));
        let job_flag = Arc::clone(&flag);

        let handle = queue.push(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            job_flag.store(true, Ordering::SeqCst);
        });
        handle.wait();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_joins_workers() {
        let queue = JobQueue::new(4);
        assert_eq!(queue.worker_count(), 4);
        let handle = queue.push(|| {});
        handle.wait();
        drop(queue);
    }

    #[test]
    #[should_panic]
    fn test_zero_workers_panics() {
        let _ = JobQueue::new(0);
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !condition() {
            assert!(
                std::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_worker_state_follows_job_lifecycle() {
        let queue = JobQueue::new(1);
        assert_eq!(queue.worker_states(), vec![WorkerState::Idle]);

        let gate = Fence::new();
        let job_gate = gate.clone();
        let handle = queue.push(move || job_gate.wait());
        wait_for(|| queue.worker_states()[0] == WorkerState::Running);

        gate.signal();
        handle.wait();
        assert_eq!(queue.worker_states(), vec![WorkerState::Idle]);
    }

    #[test]
    fn test_pending_count_tracks_queued_jobs() {
        let queue = JobQueue::new(1);
        let gate = Fence::new();
        let job_gate = gate.clone();
        let first = queue.push(move || job_gate.wait());
        // The gated job saturates the single worker once dequeued.
        wait_for(|| queue.pending_count() == 0);

        let second = queue.push(|| {});
        let third = queue.push(|| {});
        assert_eq!(queue.pending_count(), 2);

        gate.signal();
        first.wait();
        second.wait();
        third.wait();
        assert_eq!(queue.pending_count(), 0);
    }
}
