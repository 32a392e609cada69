//! Background callback workers
//!
//! One [`Finisher`] is a single named thread draining a FIFO of closures.
//! The store runs two: one invoking commit callbacks, one replaying wal
//! transactions. A panicking job is contained so the worker (and `drain`)
//! survive it.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    q: Mutex<VecDeque<Job>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    active: AtomicUsize,
}

pub(crate) struct Finisher {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Finisher {
    pub fn new(name: &str) -> Self {
        let inner = Arc::new(Inner {
            q: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        });
        let worker = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&worker))
            .expect("failed to spawn finisher thread");
        Self {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn queue(&self, job: impl FnOnce() + Send + 'static) {
        {
            let mut q = self.inner.q.lock();
            q.push_back(Box::new(job));
        }
        self.inner.work_ready.notify_one();
    }

    /// Block until every queued and in-flight job finished.
    pub fn drain(&self) {
        let mut q = self.inner.q.lock();
        while !q.is_empty() || self.inner.active.load(Ordering::Acquire) > 0 {
            self.inner.drain_cond.wait(&mut q);
        }
    }

    /// Drain remaining jobs, stop the worker, and join it. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            // hold the queue lock while notifying so a worker between its
            // shutdown check and wait cannot miss the wakeup
            let _q = self.inner.q.lock();
            self.inner.work_ready.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ActiveGuard<'a>(&'a Inner);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let prev = self.0.active.fetch_sub(1, Ordering::Release);
        if prev == 1 {
            let _q = self.0.q.lock();
            self.0.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let job = {
            let mut q = inner.q.lock();
            loop {
                if let Some(job) = q.pop_front() {
                    inner.active.fetch_add(1, Ordering::Release);
                    break job;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.drain_cond.notify_all();
                inner.work_ready.wait(&mut q);
            }
        };

        let _guard = ActiveGuard(inner);
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            error!("finisher job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_run_in_fifo_order() {
        let f = Finisher::new("test-finisher");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            f.queue(move || order.lock().push(i));
        }
        f.drain();
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
        f.shutdown();
    }

    #[test]
    fn test_drain_idle_returns() {
        let f = Finisher::new("test-finisher");
        f.drain();
        f.shutdown();
    }

    #[test]
    fn test_shutdown_runs_remaining_jobs() {
        let f = Finisher::new("test-finisher");
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let count = Arc::clone(&count);
            f.queue(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        f.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_panicking_job_does_not_hang_drain() {
        let f = Finisher::new("test-finisher");
        f.queue(|| panic!("intentional test panic"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        f.queue(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        f.drain();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        f.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let f = Finisher::new("test-finisher");
        f.shutdown();
        f.shutdown();
    }
}
