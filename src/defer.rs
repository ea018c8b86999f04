use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;

use concurrent_queue::{ConcurrentQueue, PushError};

use crate::reactor::Reactor;

pub(crate) type Task = Box<dyn FnOnce(&Reactor) + Send>;

const QUEUE_CAP: usize = 65_536;

/// Process-wide deferred-task engine: two bounded lock-free MPMC rings
/// (normal and urgent) drained by the worker-thread pool and by the
/// reactor thread between polls.
///
/// Ordering: tasks from one producer run in push order within a ring;
/// nothing is promised across producers. The urgent ring exists for I/O
/// readiness dispatch and is always drained first.
pub(crate) struct TaskQueue {
    normal: ConcurrentQueue<Task>,
    urgent: ConcurrentQueue<Task>,
    lock: Mutex<()>,
    available: Condvar,
    stopped: AtomicBool,
}

impl TaskQueue {
    pub(crate) fn new() -> TaskQueue {
        TaskQueue {
            normal: ConcurrentQueue::bounded(QUEUE_CAP),
            urgent: ConcurrentQueue::bounded(QUEUE_CAP),
            lock: Mutex::new(()),
            available: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, task: Task) {
        Self::push_to(&self.normal, task);
        self.available.notify_one();
    }

    /// Queue-jump; reserved for readiness dispatch from the reactor.
    pub(crate) fn push_urgent(&self, task: Task) {
        Self::push_to(&self.urgent, task);
        self.available.notify_one();
    }

    /// Spin-then-sleep back-off when the ring is momentarily full; the
    /// producer is the one that pays for the pressure.
    fn push_to(queue: &ConcurrentQueue<Task>, mut task: Task) {
        let mut spins = 0u32;
        loop {
            match queue.push(task) {
                Ok(()) => return,
                Err(PushError::Full(t)) => {
                    task = t;
                    spins += 1;
                    if spins < 64 {
                        thread::yield_now();
                    } else {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                Err(PushError::Closed(_)) => return,
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        self.urgent.pop().ok().or_else(|| self.normal.pop().ok())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.urgent.is_empty() && self.normal.is_empty()
    }

    /// Drains until both rings are empty. Used on the reactor thread
    /// between polls and during shutdown.
    pub(crate) fn perform(&self, r: &Reactor) {
        while let Some(task) = self.pop() {
            task(r);
        }
    }

    /// Worker-thread body: drain, then park until new work or stop.
    pub(crate) fn worker_loop(&self, r: &Reactor) {
        loop {
            match self.pop() {
                Some(task) => task(r),
                None => {
                    if self.stopped.load(Ordering::Acquire) {
                        return;
                    }
                    let guard = self.lock.lock().unwrap();
                    // re-check under the lock so a notify between the
                    // failed pop and this wait is not lost
                    if !self.is_empty() || self.stopped.load(Ordering::Acquire) {
                        continue;
                    }
                    let _unused = self
                        .available
                        .wait_timeout(guard, Duration::from_millis(100))
                        .unwrap();
                }
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.available.notify_all();
    }

    /// Post-fork reset: the child starts with empty rings and a live
    /// pool flag, whatever the parent had queued.
    pub(crate) fn fork_reset(&self) {
        while self.pop().is_some() {}
        self.stopped.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::TaskQueue;
    use crate::reactor::Reactor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_within_one_producer() {
        let q = TaskQueue::new();
        let r = Reactor::new().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..16 {
            let seen = seen.clone();
            q.push(Box::new(move |_| seen.lock().unwrap().push(i)));
        }
        q.perform(&r);

        assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn urgent_runs_first() {
        let q = TaskQueue::new();
        let r = Reactor::new().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let s = seen.clone();
        q.push(Box::new(move |_| s.lock().unwrap().push("normal")));
        let s = seen.clone();
        q.push_urgent(Box::new(move |_| s.lock().unwrap().push("urgent")));
        q.perform(&r);

        assert_eq!(*seen.lock().unwrap(), vec!["urgent", "normal"]);
    }

    #[test]
    fn many_producers_one_drain() {
        let q = Arc::new(TaskQueue::new());
        let r = Reactor::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..8)
            .map(|_| {
                let q = q.clone();
                let count = count.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let count = count.clone();
                        q.push(Box::new(move |_| {
                            count.fetch_add(1, Ordering::Relaxed);
                        }));
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        q.perform(&r);

        assert_eq!(count.load(Ordering::Relaxed), 8 * 1000);
    }

    #[test]
    fn fork_reset_clears_backlog() {
        let q = TaskQueue::new();
        q.push(Box::new(|_| panic!("stale task survived the fork")));
        q.fork_reset();
        assert!(q.is_empty());
    }
}
