//! Cancellable timers over a host-driven clock.
//!
//! [`TimerQueue`] never sleeps. Tests move its clock by hand; the console
//! moves it to the real elapsed time whenever its loop wakes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

const MIN_PERIOD: Duration = Duration::from_millis(1);

pub trait Scheduler {
    /// Time since the scheduler's epoch.
    fn now(&self) -> Duration;
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerHandle;
    fn schedule_repeating(&self, period: Duration, task: Box<dyn FnMut()>) -> TimerHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Pending,
    Fired,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Rc<Cell<TimerState>>,
}

impl TimerHandle {
    fn pending() -> Self {
        Self {
            state: Rc::new(Cell::new(TimerState::Pending)),
        }
    }

    /// Stops the timer. Calling it again, or after a one-shot fired, does nothing.
    pub fn cancel(&self) {
        if self.state.get() == TimerState::Pending {
            self.state.set(TimerState::Cancelled);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.get() == TimerState::Pending
    }
}

enum Task {
    Once(Box<dyn FnOnce()>),
    Repeating {
        period: Duration,
        task: Box<dyn FnMut()>,
    },
}

struct Entry {
    due: Duration,
    seq: u64,
    state: Rc<Cell<TimerState>>,
    task: Task,
}

#[derive(Default)]
struct QueueInner {
    now: Cell<Duration>,
    next_seq: Cell<u64>,
    entries: RefCell<Vec<Entry>>,
}

#[derive(Clone, Default)]
pub struct TimerQueue {
    inner: Rc<QueueInner>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, delta: Duration) -> usize {
        self.advance_to(self.inner.now.get() + delta)
    }

    /// Runs every timer due at or before `target` in deadline order and
    /// leaves the clock at `target`. Returns how many callbacks ran.
    pub fn advance_to(&self, target: Duration) -> usize {
        let mut fired = 0;
        while let Some(entry) = self.pop_due(target) {
            if entry.due > self.inner.now.get() {
                self.inner.now.set(entry.due);
            }
            fired += 1;
            match entry.task {
                Task::Once(task) => {
                    entry.state.set(TimerState::Fired);
                    task();
                }
                Task::Repeating { period, mut task } => {
                    task();
                    if entry.state.get() == TimerState::Pending {
                        let due = entry.due + period;
                        self.push(due, entry.state, Task::Repeating { period, task });
                    }
                }
            }
        }
        if target > self.inner.now.get() {
            self.inner.now.set(target);
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner
            .entries
            .borrow()
            .iter()
            .filter(|entry| entry.state.get() == TimerState::Pending)
            .map(|entry| entry.due)
            .min()
    }

    pub fn pending(&self) -> usize {
        self.inner
            .entries
            .borrow()
            .iter()
            .filter(|entry| entry.state.get() == TimerState::Pending)
            .count()
    }

    fn pop_due(&self, target: Duration) -> Option<Entry> {
        let mut entries = self.inner.entries.borrow_mut();
        entries.retain(|entry| entry.state.get() == TimerState::Pending);
        let idx = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.due <= target)
            .min_by_key(|(_, entry)| (entry.due, entry.seq))
            .map(|(idx, _)| idx)?;
        Some(entries.swap_remove(idx))
    }

    fn push(&self, due: Duration, state: Rc<Cell<TimerState>>, task: Task) {
        let seq = self.inner.next_seq.get() + 1;
        self.inner.next_seq.set(seq);
        self.inner.entries.borrow_mut().push(Entry {
            due,
            seq,
            state,
            task,
        });
    }
}

impl Scheduler for TimerQueue {
    fn now(&self) -> Duration {
        self.inner.now.get()
    }

    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerHandle {
        let handle = TimerHandle::pending();
        self.push(
            self.inner.now.get() + delay,
            handle.state.clone(),
            Task::Once(task),
        );
        handle
    }

    fn schedule_repeating(&self, period: Duration, task: Box<dyn FnMut()>) -> TimerHandle {
        let period = period.max(MIN_PERIOD);
        let handle = TimerHandle::pending();
        self.push(
            self.inner.now.get() + period,
            handle.state.clone(),
            Task::Repeating { period, task },
        );
        handle
    }
}
