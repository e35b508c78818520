use std::thread;
use std::thread::JoinHandle;
use crossbeam::channel;
use crossbeam::channel::{Sender, Receiver};
use crate::{ThreadPool, Result};
use tracing::{error, debug};

/// how many queued jobs each worker thread is backed by; the listener blocks
/// once the queue is this full
const QUEUE_DEPTH_PER_THREAD: usize = 4;

/// A thread pool implemented with a shared job queue (i.e. channel).
///
/// This implementation uses the MPMC [`channel`] provided by the crossbeam crate.
/// Specifically, we are using it as a single producer, multiple consumer. The single producer
/// is this type itself, and the threads in the pool are the consumers. The channel is
/// bounded, so a flood of connections applies backpressure to the listener instead of
/// queueing without limit.
///
/// If a spawned task panics, the old thread will be destroyed and a new one will be
/// created. It fails silently when any failure to create the thread at the OS level
/// is captured after the thread pool is created.
///
/// [`channel`]: https://docs.rs/crossbeam/0.8.1/crossbeam/channel/index.html
pub struct SharedQueueThreadPool {
    /// the sending part of the channel; dropped to signal the workers to exit
    tx: Option<Sender<Box<dyn FnOnce() + Send + 'static>>>,
    /// the worker threads, joined at shutdown
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool for SharedQueueThreadPool {

    /// create a new "thread pool" with the given number of `threads`.
    /// Every thread created will have a handle to the receiving end of the channel
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::bounded::<Box<dyn FnOnce() + Send + 'static>>(
            threads as usize * QUEUE_DEPTH_PER_THREAD,
        );
        let mut handles = Vec::with_capacity(threads as usize);
        for _ in 0..threads {
            let task_rx = TaskReceiver(rx.clone());
            handles.push(thread::Builder::new().spawn(move || run_tasks(task_rx))?);
        }
        Ok(SharedQueueThreadPool { tx: Some(tx), handles })
    }

    /// Spawns a function into the thread pool, blocking while the queue is full.
    ///
    /// # Panics
    ///
    /// Panics if the thread pool has no thread.
    fn spawn<F>(&self, job: F)
        where
            F: FnOnce() + Send + 'static,
    {
        self.tx
            .as_ref()
            .expect("the thread pool has shut down")
            .send(Box::new(job))
            .expect("There are no threads in the pool");
    }

    /// Drops the sending half so the workers drain the queue and exit, then
    /// joins them.
    fn shutdown(mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("a worker thread panicked while shutting down");
            }
        }
    }
}

/// A type that can receive tasks (i.e. closures) from a channel and run them.
/// Additionally, this type is responsible for restarting any threads that panicked
#[derive(Clone)]
struct TaskReceiver(Receiver<Box<dyn FnOnce() + Send + 'static>>);

impl Drop for TaskReceiver {
    fn drop(&mut self) {
        if thread::panicking() {
            debug!("thread panicked, starting a new thread");
            let task_rx = self.clone();
            if let Err(e) = thread::Builder::new().spawn(move || run_tasks(task_rx)) {
                error!("Failed to spawn a thread: {}", e);
            }
        }
    }
}

/// this function waits for a task to arrive on its (wrapped) receiver, and then runs the task.
/// it exits when the sending half of the channel is gone
fn run_tasks(rx: TaskReceiver) {
    loop {
        match rx.0.recv() {
            Ok(task) => {
                debug!("received a new task");
                task();
            }
            Err(_) => {
                debug!("Thread exited because the thread pool was destroyed.");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_every_job() {
        let pool = SharedQueueThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn survives_a_panicking_job() {
        let pool = SharedQueueThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.spawn(|| panic!("job blew up"));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // respawned workers are not joined by shutdown, so poll for the work
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) == 20 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
