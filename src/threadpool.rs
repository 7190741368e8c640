use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, error, warn};

/// Simple threadpool for detached jobs, joining all threads on drop.
///
/// Heavily inspired by the one in the Rust book:
/// https://doc.rust-lang.org/book/ch20-02-multithreaded.html
///
/// A panicking job is logged and does not take its worker down.
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    /// Create a new ThreadPool with `size` threads named `<name>-<index>`.
    ///
    /// A size of 0 is bumped to 1.
    pub fn new(name: &str, size: usize) -> std::io::Result<ThreadPool> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));

        for index in 0..size {
            workers.push(Worker::new(
                format!("{}-{}", name, index),
                Arc::clone(&receiver),
            )?);
        }
        Ok(ThreadPool {
            workers,
            sender: Some(sender),
        })
    }

    /// Queue a task to run on the threadpool when a worker is available.
    ///
    /// Returns false if the job could not be queued because every worker is gone.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let queued = self
            .sender
            .as_ref()
            .map(|sender| sender.send(Box::new(f)).is_ok())
            .unwrap_or(false);
        if !queued {
            warn!("Threadpool is shut down, dropping job");
        }
        queued
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in &mut self.workers {
            if let Some(thread) = worker.handle.take() {
                if thread.join().is_err() {
                    error!(worker = %worker.name, "Worker thread panicked");
                }
            }
        }
    }
}

/// Type of jobs to be executed by the threadpool.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker struct, holding a thread handle.
struct Worker {
    name: String,
    handle: Option<thread::JoinHandle<()>>,
}

/// Create a new worker that will execute jobs from the given receiver until this one is closed.
impl Worker {
    fn new(name: String, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> std::io::Result<Worker> {
        let handle = thread::Builder::new().name(name.clone()).spawn(move || loop {
            let message = receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv();
            match message {
                Ok(job) => {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Detached job panicked");
                    }
                }
                Err(_) => break,
            }
        })?;
        debug!(worker = %name, "Worker started");
        Ok(Worker {
            name,
            handle: Some(handle),
        })
    }
}
