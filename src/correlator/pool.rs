//! Fixed-size worker pool for blocking requests.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::error;

use crate::error::CorrelatorError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded set of named threads draining one job queue.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize, name: &str) -> Self {
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size.max(1) {
            let receiver = Arc::clone(&receiver);
            match thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || work(receiver))
            {
                Ok(handle) => workers.push(handle),
                Err(err) => error!(pool = name, error = %err, "failed to spawn worker"),
            }
        }

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn execute<F>(&self, job: F) -> Result<(), CorrelatorError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.workers.lock().is_empty() {
            return Err(CorrelatorError::PoolClosed);
        }
        match self.sender.lock().as_ref() {
            Some(sender) => sender
                .send(Box::new(job))
                .map_err(|_| CorrelatorError::PoolClosed),
            None => Err(CorrelatorError::PoolClosed),
        }
    }

    /// Stop accepting jobs, let queued ones finish and join the workers.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit once the queue disconnects; no join here.
        self.sender.lock().take();
    }
}

fn work(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = receiver.lock().recv();
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}
