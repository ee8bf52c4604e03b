use std::{
    io,
    sync::{Arc, Mutex, mpsc},
    thread,
};

use log::{debug, warn};
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("thread pool '{0}' is shutting down")]
    Closed(&'static str),

    #[error("failed to start a '{0}' worker: {1}")]
    Spawn(&'static str, #[source] io::Error),
}

/// Fixed set of named worker threads fed from one job queue. Worker `i` of
/// pool `name` runs on a thread called `name-i`. Dropping the pool lets
/// queued jobs finish and joins every worker.
#[derive(Debug)]
pub struct ThreadPool {
    name: &'static str,
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(name: &'static str, size: usize) -> Result<Self, PoolError> {
        assert!(size > 0);

        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut pool = Self {
            name,
            workers: Vec::with_capacity(size),
            sender: Some(sender),
        };

        // On failure the partially built pool is dropped, which joins the
        // workers already started.
        for i in 0..size {
            let worker = Worker::new(name, i, Arc::clone(&receiver))
                .map_err(|e| PoolError::Spawn(name, e))?;
            pool.workers.push(worker);
        }

        Ok(pool)
    }

    pub fn execute<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        self.sender
            .as_ref()
            .ok_or(PoolError::Closed(self.name))?
            .send(job)
            .map_err(|_| PoolError::Closed(self.name))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down {} worker {}", self.name, worker.id);

            if worker.thread.join().is_err() {
                warn!("{} worker {} panicked", self.name, worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(
        name: &'static str,
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("{name}-{id}"))
            .spawn(move || {
                loop {
                    let msg = match receiver.lock() {
                        Ok(receiver) => receiver.recv(),
                        Err(_) => break,
                    };
                    match msg {
                        Ok(job) => {
                            debug!("{name} worker {id} picked up a job");
                            job();
                        }
                        Err(_) => {
                            debug!("{name} worker {id} disconnected");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}
