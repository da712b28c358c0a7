use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};

/// A fixed set of jobs shared across worker threads, with a result sink.
///
/// Every bounded fan-out in this crate (multi-region stack listing, parallel
/// registry login, multipart part upload, batch transfers) drains one of
/// these: the dispatcher creates the queue with the complete job list, spawns
/// as many workers as the concurrency budget allows, and each worker pops
/// jobs until the queue is dry. Jobs cannot be added after construction,
/// which lets the queue be a plain `Vec` behind a mutex rather than a deque.
#[derive(Debug)]
pub(crate) struct WorkQueue<T, R> {
    jobs: Arc<Mutex<Vec<T>>>,
    results: Arc<Mutex<Vec<R>>>,
}

impl<T, R> Clone for WorkQueue<T, R> {
    fn clone(&self) -> Self {
        WorkQueue {
            jobs: self.jobs.clone(),
            results: self.results.clone(),
        }
    }
}

impl<T, R> WorkQueue<T, R> {
    pub(crate) fn new(jobs: Vec<T>) -> Self {
        WorkQueue {
            jobs: Arc::new(Mutex::new(jobs)),
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Pops a job off the queue, or returns None if the queue is empty.
    ///
    /// # Panics
    ///
    /// Panics if the mutex protecting the job queue is poisoned.
    pub(crate) fn dequeue_job(&self) -> Option<T> {
        self.jobs.lock().unwrap().pop()
    }

    /// Records the result of one or more jobs. Workers need not call this 1:1
    /// with `dequeue_job` if a single R can describe several jobs.
    ///
    /// # Panics
    ///
    /// Panics if the mutex protecting the results is poisoned.
    pub(crate) fn push_result(&self, result: R) {
        self.results.lock().unwrap().push(result)
    }

    /// Consumes the queue and returns the collected results. All clones of
    /// this queue must have been dropped (i.e. all workers joined) before
    /// calling this.
    ///
    /// # Errors
    ///
    /// Returns an error if jobs remain in the queue or if a clone of the
    /// queue is still alive.
    pub(crate) fn into_results(self) -> Result<Vec<R>> {
        if !self.jobs.lock().unwrap().is_empty() {
            return Err(anyhow!("cannot collect results before all jobs are dequeued"));
        }
        let mutex = Arc::try_unwrap(self.results).map_err(|_| {
            anyhow!("outstanding strong reference to work queue (worker thread not joined?)")
        })?;
        Ok(mutex.into_inner().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::{self, JoinHandle};

    #[test]
    fn drain_across_threads() {
        let work_queue: WorkQueue<Vec<u32>, u32> =
            WorkQueue::new(vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]]);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for _ in 0..2 {
            let queue = work_queue.clone();
            handles.push(thread::spawn(move || {
                while let Some(job) = queue.dequeue_job() {
                    queue.push_result(job.iter().sum());
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let results = work_queue.into_results().unwrap();
        assert_eq!(results.iter().sum::<u32>(), 45);
    }

    #[test]
    fn results_before_drain_is_an_error() {
        let work_queue: WorkQueue<u32, u32> = WorkQueue::new(vec![1]);
        work_queue.clone().into_results().unwrap_err();
    }
}
