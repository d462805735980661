//! Cooperative timer wheel
//!
//! A single-threaded monotonic scheduler. Entries are keyed on an absolute
//! deadline in nanoseconds and fired in non-decreasing deadline order by
//! `tick()`. Every callback fired within one tick receives the same
//! timestamp: the tick start, not the current clock.
//!
//! The root is deliberately `!Send` (callbacks are plain boxed closures),
//! which enforces the one-root-per-thread rule at the type level. Entries
//! are created at component init and cancelled by handle at teardown;
//! mutating the root from inside a callback is not supported.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use crate::clock::Timestamp;

/// Sleep returned by `tick()` when no timers are armed.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Opaque cancellation handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

enum Task {
    Periodic {
        interval_ns: u64,
        cb: Box<dyn FnMut(Timestamp)>,
    },
    OneShot {
        cb: Box<dyn FnOnce(Timestamp)>,
    },
}

struct Entry {
    name: String,
    task: Task,
}

/// Heap key: deadline first, then insertion sequence for a stable order
/// among entries sharing a deadline.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    deadline_ns: u64,
    seq: u64,
    id: u64,
}

/// Per-thread timer root.
#[derive(Default)]
pub struct TimerRoot {
    heap: BinaryHeap<Reverse<Key>>,
    entries: HashMap<u64, Entry>,
    next_id: u64,
    next_seq: u64,
}

impl TimerRoot {
    pub fn new() -> Self {
        TimerRoot::default()
    }

    /// Arm a periodic timer. The first firing happens `initial_delay`
    /// from now, subsequent firings every `interval` on a fixed cadence
    /// grid.
    pub fn add_periodic(
        &mut self,
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        cb: impl FnMut(Timestamp) + 'static,
    ) -> TimerHandle {
        let interval_ns = (interval.as_nanos() as u64).max(1);
        self.insert(
            name,
            initial_delay,
            Task::Periodic {
                interval_ns,
                cb: Box::new(cb),
            },
        )
    }

    /// Arm a one-shot timer firing `delay` from now.
    pub fn add_one_shot(
        &mut self,
        name: &str,
        delay: Duration,
        cb: impl FnOnce(Timestamp) + 'static,
    ) -> TimerHandle {
        self.insert(name, delay, Task::OneShot { cb: Box::new(cb) })
    }

    fn insert(&mut self, name: &str, delay: Duration, task: Task) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let deadline_ns = Timestamp::now().as_nanos() + delay.as_nanos() as u64;
        self.entries.insert(
            id,
            Entry {
                name: name.to_string(),
                task,
            },
        );
        self.push_key(deadline_ns, id);
        tracing::debug!(timer = name, id, "timer armed");
        TimerHandle(id)
    }

    /// Cancel by handle. Already-fired callbacks have completed; a pending
    /// heap key for a cancelled entry is skipped lazily on pop.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(entry) = self.entries.remove(&handle.0) {
            tracing::debug!(timer = %entry.name, id = handle.0, "timer cancelled");
        }
    }

    pub fn armed(&self) -> usize {
        self.entries.len()
    }

    /// Run all expired callbacks and return how long the driver may sleep
    /// until the next deadline.
    pub fn tick(&mut self) -> Duration {
        self.tick_at(Timestamp::now())
    }

    /// `tick()` against an explicit tick-start timestamp.
    pub fn tick_at(&mut self, now: Timestamp) -> Duration {
        let now_ns = now.as_nanos();
        while let Some(Reverse(key)) = self.heap.peek() {
            if key.deadline_ns > now_ns {
                break;
            }
            let Reverse(key) = self.heap.pop().unwrap();
            // Cancelled entries leave stale keys behind.
            let Some(mut entry) = self.entries.remove(&key.id) else {
                continue;
            };
            match entry.task {
                Task::Periodic {
                    interval_ns,
                    ref mut cb,
                } => {
                    cb(now);
                    let next = next_on_grid(key.deadline_ns, interval_ns, now_ns);
                    self.entries.insert(key.id, entry);
                    self.push_key(next, key.id);
                }
                Task::OneShot { cb } => cb(now),
            }
        }
        self.next_sleep(now_ns)
    }

    fn next_sleep(&self, now_ns: u64) -> Duration {
        match self.heap.peek() {
            Some(Reverse(key)) => Duration::from_nanos(key.deadline_ns.saturating_sub(now_ns)),
            None => IDLE_SLEEP,
        }
    }

    fn push_key(&mut self, deadline_ns: u64, id: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Key {
            deadline_ns,
            seq,
            id,
        }));
    }
}

/// Next deadline on the cadence grid strictly after `now_ns`. Missed grid
/// points are skipped rather than fired as a burst.
fn next_on_grid(deadline_ns: u64, interval_ns: u64, now_ns: u64) -> u64 {
    let mut next = deadline_ns + interval_ns;
    if next <= now_ns {
        let missed = (now_ns - deadline_ns) / interval_ns;
        next = deadline_ns + (missed + 1) * interval_ns;
    }
    next
}
