//! A small fixed thread pool draining the block cache's read and write-back jobs,
//! shaped after the teacher's `scheduling::worker::WorkerPool` (a named pool of threads
//! pulling closures off a shared queue) but synchronous and without the Redis-backed
//! job/heartbeat machinery that pool used for distributed scheduling.

use crossbeam::channel::{bounded, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of `num_threads` worker threads.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    tasks_completed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(num_threads: usize) -> Self {
        let (sender, receiver) = bounded::<Job>(num_threads.max(1) * 4);
        let tasks_completed = Arc::new(AtomicU64::new(0));
        let handles = (0..num_threads.max(1))
            .map(|n| {
                let receiver = receiver.clone();
                let tasks_completed = tasks_completed.clone();
                std::thread::Builder::new()
                    .name(format!("block-cache-worker-{n}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                            tasks_completed.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                    .expect("failed to spawn block cache worker thread")
            })
            .collect();
        Self {
            sender: Some(sender),
            handles,
            tasks_completed,
        }
    }

    /// Schedules `job` for execution on the next free worker. The number of in-flight
    /// jobs is bounded by the pool's own queue capacity, naturally throttling the number
    /// of concurrent downstream operations to `num_threads` plus a small buffer.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }

    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping the sender closes the channel; workers exit once the queue drains.
        self.sender = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
