//! This module provides the thread pool implementations that serve client
//! connections.
use crate::Result;

/// A trait for the basic functionality of a pool of worker threads
pub trait ThreadPool {
    /// creates a new thread pool with the given number of `threads`
    ///
    /// # Errors
    /// returns an error if any worker thread could not be started
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// Spawns a function into the thread pool.
    ///
    /// Spawning always succeeds, but if the function panics the thread pool
    /// continues to operate with the same number of threads: the thread
    /// count is not reduced, nor is the pool destroyed, corrupted or invalidated.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;

    /// Stops accepting new jobs, lets queued jobs drain, and waits for the
    /// workers to finish. The default implementation does nothing, for pools
    /// whose threads are not tracked.
    fn shutdown(self)
    where
        Self: Sized,
    {
    }
}

mod shared_queue;

pub use self::shared_queue::SharedQueueThreadPool;
