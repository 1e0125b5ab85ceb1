//! A module for thread pool.
//!
//! The pooled servers hand every accepted connection or received datagram to
//! a fixed set of workers instead of creating a thread or process per client.
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, mpsc},
    thread::{self},
};

use log::{debug, error};

use crate::error::{CalcError, Result};

/// A trait for thread pools.
pub trait ThreadPool: Sized {
    /// Create a new thread pool.
    fn new(threads: u32) -> Result<Self>;
    /// Spawn a new job on the thread pool.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    NewJob(Job),
    Terminate,
}

/// A bounded pool of workers sharing one job queue.
pub struct WorkerPool {
    workers: Vec<Worker>,
    sender: mpsc::Sender<Message>,
}

impl ThreadPool for WorkerPool {
    fn new(threads: u32) -> Result<Self> {
        if threads == 0 {
            return Err(CalcError::Config(
                "a worker pool needs at least one thread".to_string(),
            ));
        }
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..threads)
            .map(|id| Worker::new(id, receiver.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { workers, sender })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(Message::NewJob(Box::new(job))).is_err() {
            error!("every worker has exited, dropping job");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(Message::Terminate);
        }

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if let Err(e) = thread.join() {
                    error!("worker {} join failed: {:?}", worker.id, e);
                }
            }
        }
    }
}

struct Worker {
    id: u32,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(id: u32, receiver: Arc<Mutex<mpsc::Receiver<Message>>>) -> Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("calc-worker-{id}"))
            .spawn(move || {
                loop {
                    let msg = match receiver.lock() {
                        Ok(receiver) => receiver.recv(),
                        Err(_) => break,
                    };
                    match msg {
                        Ok(Message::NewJob(job)) => {
                            if let Err(e) = catch_unwind(AssertUnwindSafe(job)) {
                                error!("worker {} job panicked: {:?}", id, e);
                            }
                        }
                        Ok(Message::Terminate) | Err(_) => break,
                    }
                }
                debug!("worker {} exiting", id);
            })?;
        Ok(Self {
            id,
            thread: Some(thread),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_utils::sync::WaitGroup;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_job() {
        let pool = WorkerPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let wg = WaitGroup::new();
        for _ in 0..32 {
            let counter = counter.clone();
            let wg = wg.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(wg);
            });
        }
        wg.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn survives_panicking_jobs() {
        let pool = WorkerPool::new(1).unwrap();
        pool.spawn(|| panic!("boom"));

        let wg = WaitGroup::new();
        let done = Arc::new(AtomicUsize::new(0));
        {
            let wg = wg.clone();
            let done = done.clone();
            pool.spawn(move || {
                done.store(1, Ordering::SeqCst);
                drop(wg);
            });
        }
        wg.wait();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_threads_is_a_config_error() {
        assert!(matches!(WorkerPool::new(0), Err(CalcError::Config(_))));
    }
}
