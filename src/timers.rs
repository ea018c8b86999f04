use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::reactor::Reactor;

/// Schedule for a repeating timer; consumed by
/// [`Reactor::run_every`](crate::Reactor::run_every).
///
/// `times(0)` (or never calling `times`) repeats forever. A finish
/// callback runs after the last repetition, or at process stop for
/// endless timers.
pub struct Every {
    pub(crate) interval: Duration,
    pub(crate) reps: i32,
    pub(crate) on_finish: Option<Box<dyn FnOnce(&Reactor) + Send>>,
}

impl Every {
    pub fn new(interval: Duration) -> Every {
        Every {
            interval,
            reps: -1,
            on_finish: None,
        }
    }

    /// Total number of runs; `0` means unbounded.
    pub fn times(mut self, reps: u32) -> Every {
        self.reps = if reps == 0 { -1 } else { reps as i32 };
        self
    }

    pub fn on_finish(mut self, f: impl FnOnce(&Reactor) + Send + 'static) -> Every {
        self.on_finish = Some(Box::new(f));
        self
    }
}

pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    pub(crate) interval: Option<Duration>,
    /// Remaining runs; `-1` repeats forever.
    pub(crate) reps: i32,
    pub(crate) task: Box<dyn FnMut(&Reactor) + Send>,
    pub(crate) on_finish: Option<Box<dyn FnOnce(&Reactor) + Send>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the nearest deadline wins
        other.deadline.cmp(&self.deadline)
    }
}

/// Min-heap timer store on the monotonic clock. The reactor asks for
/// [`next_deadline`](Timers::next_deadline) before every poll and runs
/// whatever [`take_due`](Timers::take_due) returns after it.
pub(crate) struct Timers {
    heap: Mutex<BinaryHeap<TimerEntry>>,
}

impl Timers {
    pub(crate) fn new() -> Timers {
        Timers {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub(crate) fn schedule(&self, entry: TimerEntry) {
        self.heap.lock().unwrap().push(entry);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().unwrap().peek().map(|e| e.deadline)
    }

    pub(crate) fn take_due(&self, now: Instant) -> Vec<TimerEntry> {
        let mut heap = self.heap.lock().unwrap();
        let mut due = Vec::new();
        while heap.peek().map(|e| e.deadline <= now).unwrap_or(false) {
            due.push(heap.pop().unwrap());
        }
        due
    }

    /// Runs one due entry and either re-arms it or retires it with its
    /// finish callback.
    pub(crate) fn fire(&self, r: &Reactor, mut entry: TimerEntry) {
        (entry.task)(r);

        if entry.reps > 0 {
            entry.reps -= 1;
        }

        match (entry.reps, entry.interval) {
            (0, _) | (_, None) => {
                if let Some(f) = entry.on_finish.take() {
                    f(r);
                }
            }
            (_, Some(interval)) => {
                entry.deadline = Instant::now() + interval;
                self.schedule(entry);
            }
        }
    }

    /// Retires every pending timer, running finish callbacks; the
    /// process is stopping.
    pub(crate) fn finish_all(&self, r: &Reactor) {
        let drained: Vec<_> = self.heap.lock().unwrap().drain().collect();
        for mut entry in drained {
            if let Some(f) = entry.on_finish.take() {
                f(r);
            }
        }
    }

    /// A forked child starts with an empty wheel.
    pub(crate) fn fork_reset(&self) {
        self.heap.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{TimerEntry, Timers};
    use crate::reactor::Reactor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn entry(deadline: Instant, reps: i32, interval: Option<Duration>) -> TimerEntry {
        TimerEntry {
            deadline,
            interval,
            reps,
            task: Box::new(|_| {}),
            on_finish: None,
        }
    }

    #[test]
    fn nearest_deadline_first() {
        let timers = Timers::new();
        let now = Instant::now();
        timers.schedule(entry(now + Duration::from_millis(50), 1, None));
        timers.schedule(entry(now + Duration::from_millis(10), 1, None));
        timers.schedule(entry(now + Duration::from_millis(30), 1, None));

        assert_eq!(
            timers.next_deadline().unwrap(),
            now + Duration::from_millis(10)
        );

        let due = timers.take_due(now + Duration::from_millis(35));
        let deadlines: Vec<_> = due.iter().map(|e| e.deadline).collect();
        assert_eq!(
            deadlines,
            vec![now + Duration::from_millis(10), now + Duration::from_millis(30)]
        );
        assert!(timers.next_deadline().is_some());
    }

    #[test]
    fn nothing_due_before_deadline() {
        let timers = Timers::new();
        let now = Instant::now();
        timers.schedule(entry(now + Duration::from_secs(60), 1, None));
        assert!(timers.take_due(now).is_empty());
    }

    #[test]
    fn repeating_entry_re_arms_until_spent() {
        let timers = Timers::new();
        let r = Reactor::new().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let runs2 = runs.clone();
        let finished2 = finished.clone();
        timers.schedule(TimerEntry {
            deadline: Instant::now(),
            interval: Some(Duration::from_millis(1)),
            reps: 3,
            task: Box::new(move |_| {
                runs2.fetch_add(1, Ordering::Relaxed);
            }),
            on_finish: Some(Box::new(move |_| {
                finished2.fetch_add(1, Ordering::Relaxed);
            })),
        });

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(2));
            for e in timers.take_due(Instant::now()) {
                timers.fire(&r, e);
            }
        }

        assert_eq!(runs.load(Ordering::Relaxed), 3);
        assert_eq!(finished.load(Ordering::Relaxed), 1);
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn finish_all_retires_pending_timers() {
        let timers = Timers::new();
        let r = Reactor::new().unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        let f = finished.clone();
        timers.schedule(TimerEntry {
            deadline: Instant::now() + Duration::from_secs(60),
            interval: Some(Duration::from_secs(60)),
            reps: -1,
            task: Box::new(|_| {}),
            on_finish: Some(Box::new(move |_| {
                f.fetch_add(1, Ordering::Relaxed);
            })),
        });

        timers.finish_all(&r);
        assert_eq!(finished.load(Ordering::Relaxed), 1);
        assert!(timers.next_deadline().is_none());
    }
}
