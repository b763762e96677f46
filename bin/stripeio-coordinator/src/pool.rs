//! Bounded task pool.
//!
//! Actions submit closures and keep the returned handles in a queue; when
//! the queue crosses its threshold they drain completed work before
//! submitting more. Tasks handle their own failures (logging, not
//! propagating), so a handle only signals completion.

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver};
use std::collections::VecDeque;

/// Completion handle for one submitted task.
pub struct TaskHandle {
    done: Receiver<()>,
}

impl TaskHandle {
    /// Block until the task finishes.
    pub fn wait(self) {
        let _ = self.done.recv();
    }
}

/// Thread pool wrapper handing out completion handles.
pub struct TaskPool {
    pool: rayon::ThreadPool,
}

impl TaskPool {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pool: rayon::ThreadPoolBuilder::new().build()?,
        })
    }

    pub fn submit<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = bounded::<()>(1);
        self.pool.spawn(move || {
            task();
            drop(tx);
        });
        TaskHandle { done: rx }
    }
}

/// Once the queue reaches `threshold`, wait for everything in it.
pub fn drain_all_at(queue: &mut VecDeque<TaskHandle>, threshold: usize) {
    if queue.len() >= threshold {
        while let Some(handle) = queue.pop_front() {
            handle.wait();
        }
    }
}

/// Wait for the oldest tasks until at most `threshold` remain.
pub fn drain_to(queue: &mut VecDeque<TaskHandle>, threshold: usize) {
    while queue.len() > threshold {
        if let Some(handle) = queue.pop_front() {
            handle.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn handles_signal_completion() {
        let pool = TaskPool::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut queue = VecDeque::new();
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            queue.push_back(pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drain_to(&mut queue, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 16);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_all_at_only_fires_at_threshold() {
        let pool = TaskPool::new().unwrap();
        let mut queue = VecDeque::new();
        queue.push_back(pool.submit(|| {}));
        drain_all_at(&mut queue, 4);
        assert_eq!(queue.len(), 1);
        drain_all_at(&mut queue, 1);
        assert!(queue.is_empty());
    }
}
