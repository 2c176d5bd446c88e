//! Deferred-task queue.
//!
//! Subscription callbacks never run synchronously inside `publish`; they are
//! enqueued here and executed by the pool's worker threads, or by whoever
//! calls [`TaskQueue::perform_all`] when the pool was built with zero
//! workers (tests, shutdown drains).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct TaskQueue {
    queue: Mutex<VecDeque<Task>>,
    ready: Condvar,
    live: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(threads: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            live: AtomicBool::new(true),
            workers: Mutex::new(Vec::new()),
        });
        pool.spawn_workers(threads);
        pool
    }

    fn spawn_workers(self: &Arc<Self>, threads: usize) {
        let mut workers = lock_unpoisoned(&self.workers);
        for n in 0..threads {
            let pool = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("postoffice-task-{n}"))
                .spawn(move || pool.run())
                .expect("spawn task worker");
            workers.push(handle);
        }
    }

    pub fn defer(&self, task: Task) {
        let mut queue = lock_unpoisoned(&self.queue);
        queue.push_back(task);
        drop(queue);
        self.ready.notify_one();
    }

    fn run(&self) {
        loop {
            let task = {
                let mut queue = lock_unpoisoned(&self.queue);
                loop {
                    if let Some(task) = queue.pop_front() {
                        break task;
                    }
                    if !self.live.load(Ordering::Acquire) {
                        return;
                    }
                    let (guard, _) = self
                        .ready
                        .wait_timeout(queue, Duration::from_millis(100))
                        .unwrap_or_else(|err| err.into_inner());
                    queue = guard;
                }
            };
            task();
        }
    }

    /// Drains the queue on the calling thread. Tasks enqueued while draining
    /// (re-deferred deliveries included) are executed too.
    pub fn perform_all(&self) {
        loop {
            let task = lock_unpoisoned(&self.queue).pop_front();
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    pub fn shutdown(&self) {
        self.live.store(false, Ordering::Release);
        self.ready.notify_all();
        let handles: Vec<_> = lock_unpoisoned(&self.workers).drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.perform_all();
    }

    /// Post-fork: worker threads do not survive `fork`, so their handles are
    /// discarded without joining and a fresh set is spawned. Any tasks the
    /// parent had queued are dropped with the old queue contents.
    pub fn reset_after_fork(self: &Arc<Self>, threads: usize) {
        lock_unpoisoned(&self.workers).clear();
        lock_unpoisoned(&self.queue).clear();
        self.live.store(true, Ordering::Release);
        self.spawn_workers(threads);
    }
}

/// Locks a mutex, taking the guard even if a panicking task poisoned it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}
