//! Fixed-size, name-sharded worker pool.
//!
//! Every callback this crate invokes — pub/sub dispatch, stream reader
//! dispatch — runs here, never on the listener or reader thread. `submit`
//! hashes the job's name modulo the worker count so jobs sharing a name
//! (a stream key, a channel) always land on the same worker and therefore
//! execute in FIFO order relative to each other.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerShared {
    queue: Mutex<VecDeque<Job>>,
    cv: Condvar,
    shutdown: Mutex<bool>,
}

struct Worker {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(index: usize) -> Self {
        let shared = Arc::new(WorkerShared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: Mutex::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("radapter-worker-{index}"))
            .spawn(move || Worker::work(worker_shared))
            .expect("failed to spawn worker thread");
        Worker { shared, handle: Some(handle) }
    }

    fn work(shared: Arc<WorkerShared>) {
        loop {
            let job = {
                let mut queue = shared.queue.lock().unwrap();
                loop {
                    if let Some(job) = queue.pop_front() {
                        break Some(job);
                    }
                    if *shared.shutdown.lock().unwrap() {
                        break None;
                    }
                    queue = shared.cv.wait(queue).unwrap();
                }
            };
            match job {
                Some(job) => {
                    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                        tracing::error!(?panic, "worker job panicked");
                    }
                }
                None => break,
            }
        }
    }

    fn push(&self, job: Job) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(job);
        self.shared.cv.notify_all();
    }

    fn shutdown(&mut self) {
        *self.shared.shutdown.lock().unwrap() = true;
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A fixed pool of `N` worker threads, each with its own queue.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn new(count: usize) -> Result<Self, crate::error::AdapterError> {
        if count == 0 {
            return Err(crate::error::AdapterError::EmptyWorkerPool);
        }
        let workers = (0..count).map(Worker::spawn).collect();
        Ok(WorkerPool { workers })
    }

    /// Submit `job` under `name`. Jobs submitted under the same `name`
    /// execute in FIFO order relative to each other; no ordering is
    /// guaranteed across different names.
    pub fn submit(&self, name: &str, job: impl FnOnce() + Send + 'static) {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.workers.len();
        self.workers[index].push(Box::new(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn jobs_with_the_same_name_run_in_fifo_order() {
        let pool = WorkerPool::new(4).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..50 {
            let tx = tx.clone();
            pool.submit("same-key", move || tx.send(i).unwrap());
        }
        drop(tx);
        let received: Vec<i32> = rx.iter().collect();
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_job_does_not_stop_the_worker() {
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit("a", || panic!("boom"));
        pool.submit("a", move || tx.send(()).unwrap());
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn rejects_zero_workers() {
        assert!(WorkerPool::new(0).is_err());
    }
}
