//! Single-thread FIFO job executor.

use log::{debug, warn};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs boxed jobs one after another on a dedicated, named thread.
///
/// Jobs enqueued after [`JobQueue::shutdown`] are dropped without running.
/// A panicking job is logged and the worker moves on to the next one.
pub struct JobQueue {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        warn!("[{}] job panicked", thread_name);
                    }
                }
                debug!("[{}] job queue drained", thread_name);
            })?;

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a job. Returns `false` if the queue has been shut down.
    pub fn enqueue<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Run everything already queued, then stop the worker and join it.
    ///
    /// Calling this from a job running on the queue itself only closes the
    /// queue; the worker exits on its own once the job returns.
    pub fn shutdown(&self) {
        self.sender.lock().take();

        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("[{}] worker panicked", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
