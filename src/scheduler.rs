//! A time-ordered task queue driven by caller-provided threads.
//!
//! [`Scheduler`] keeps tasks sorted by deadline and runs each one on a
//! driver thread once its deadline elapses. Any thread becomes a driver by
//! calling [`Scheduler::run`], which loops until a stop is requested. Tasks
//! run with the queue unlocked, so a task may schedule further tasks; the
//! periodic form re-enqueues itself that way.
//!
//! A panicking task propagates out of the driving `run` call; other
//! drivers, and the queue itself, are unaffected.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

type Task = Box<dyn FnOnce() + Send>;

struct State {
    /// Tasks keyed by deadline plus an insertion sequence, so tasks with
    /// equal deadlines run in scheduling order.
    tasks: BTreeMap<(Instant, u64), Task>,
    seq: u64,
    drivers: usize,
    stop_requested: bool,
    stop_when_empty: bool,
}

struct Inner {
    state: Mutex<State>,
    ready: Condvar,
}

impl Inner {
    fn insert(&self, deadline: Instant, task: Task) {
        {
            let mut state = self.state.lock();
            let seq = state.seq;
            state.seq += 1;
            state.tasks.insert((deadline, seq), task);
        }
        self.ready.notify_one();
    }
}

/// Decrements the driver count even when a task panic unwinds `run`.
struct DriverGuard {
    inner: Arc<Inner>,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.inner.state.lock().drivers -= 1;
    }
}

/// A single-queue timer executing tasks in deadline order.
///
/// Cheap to clone; all clones share one queue.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler with an empty queue and no drivers.
    pub fn new() -> Self {
        Scheduler {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    tasks: BTreeMap::new(),
                    seq: 0,
                    drivers: 0,
                    stop_requested: false,
                    stop_when_empty: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Drive the queue on the calling thread until a stop is requested
    /// (immediately, or once the queue drains, per [`Scheduler::stop`]).
    /// Several threads may drive one scheduler concurrently.
    ///
    /// A panicking task unwinds out of this call; the queue and any other
    /// drivers keep going.
    pub fn run(&self) {
        let inner = &self.inner;
        inner.state.lock().drivers += 1;
        let _driver = DriverGuard {
            inner: Arc::clone(inner),
        };

        let mut state = inner.state.lock();
        loop {
            while !state.stop_requested && !state.stop_when_empty && state.tasks.is_empty() {
                inner.ready.wait(&mut state);
            }
            if state.stop_requested || (state.stop_when_empty && state.tasks.is_empty()) {
                break;
            }
            // Sleep until the front deadline; the front is re-read after
            // every wakeup so a newly scheduled earlier task takes effect.
            let now = Instant::now();
            match state.tasks.keys().next() {
                Some(&(deadline, _)) if deadline > now => {
                    let _ = inner.ready.wait_until(&mut state, deadline);
                    continue;
                }
                Some(_) => {}
                None => continue,
            }
            let ((_, seq), task) = state.tasks.pop_first().expect("a task is due");
            drop(state);
            trace!(seq, "running scheduled task");
            task();
            state = inner.state.lock();
        }
    }

    /// Schedule `task` to run at `deadline`. A deadline in the past runs as
    /// soon as a driver is free.
    pub fn schedule_at<F>(&self, task: F, deadline: Instant)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.insert(deadline, Box::new(task));
    }

    /// Schedule `task` to run after `delay`.
    pub fn schedule_after<F>(&self, task: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(task, Instant::now() + delay);
    }

    /// Schedule `task` to run after `first_delay` and then every `period`.
    /// The repetition holds only a weak handle to the queue, so dropping
    /// the last [`Scheduler`] clone ends the chain. Note that a periodic
    /// task keeps the queue non-empty, so a draining stop never completes
    /// while one is active.
    pub fn schedule_every<F>(&self, task: F, first_delay: Duration, period: Duration)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let weak = Arc::downgrade(&self.inner);
        self.schedule_after(move || repeat(weak, task, period), first_delay);
    }

    /// Request the drivers to stop: immediately when `drain` is false, or
    /// once the queue is empty when `drain` is true. A stopped scheduler
    /// stays stopped.
    pub fn stop(&self, drain: bool) {
        {
            let mut state = self.inner.state.lock();
            if drain {
                state.stop_when_empty = true;
            } else {
                state.stop_requested = true;
            }
        }
        debug!(drain, "scheduler stop requested");
        self.inner.ready.notify_all();
    }

    /// The number of queued tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }
}

fn repeat<F>(weak: Weak<Inner>, task: Arc<F>, period: Duration)
where
    F: Fn() + Send + Sync + 'static,
{
    (*task)();
    if let Some(inner) = weak.upgrade() {
        let next = Weak::clone(&weak);
        inner.insert(
            Instant::now() + period,
            Box::new(move || repeat(next, task, period)),
        );
    }
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Scheduler {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Scheduler")
            .field("pending", &state.tasks.len())
            .field("drivers", &state.drivers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_tasks_run_in_deadline_order() {
        let sched = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let slot = Arc::clone(&order);
        sched.schedule_after(move || slot.lock().push("late"), Duration::from_millis(60));
        let slot = Arc::clone(&order);
        sched.schedule_after(move || slot.lock().push("early"), Duration::from_millis(10));

        sched.stop(true);
        sched.run();
        assert_eq!(*order.lock(), vec!["early", "late"]);
    }

    #[test]
    fn test_equal_deadlines_run_in_scheduling_order() {
        let sched = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let deadline = Instant::now() + Duration::from_millis(10);

        for tag in ["a", "b", "c"] {
            let slot = Arc::clone(&order);
            sched.schedule_at(move || slot.lock().push(tag), deadline);
        }

        sched.stop(true);
        sched.run();
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_immediate_stop_leaves_queue() {
        let sched = Scheduler::new();
        sched.schedule_after(|| {}, Duration::from_secs(60));
        sched.stop(false);
        sched.run();
        assert_eq!(sched.pending(), 1);
    }

    #[test]
    fn test_periodic_task_repeats() {
        let sched = Scheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        sched.schedule_every(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(10),
            Duration::from_millis(10),
        );

        let driver = sched.clone();
        let handle = thread::spawn(move || driver.run());
        thread::sleep(Duration::from_millis(120));
        sched.stop(false);
        handle.join().unwrap();

        let count = hits.load(Ordering::SeqCst);
        assert!(count >= 2, "expected repeated executions, got {count}");
    }

    #[test]
    fn test_task_panic_propagates_out_of_run() {
        let sched = Scheduler::new();
        sched.schedule_after(|| panic!("task failure"), Duration::from_millis(5));
        let driver = sched.clone();
        let handle = thread::spawn(move || driver.run());
        assert!(handle.join().is_err());
        // the driver count was unwound, the queue remains usable
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        sched.schedule_after(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(5),
        );
        sched.stop(true);
        sched.run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_counts_queued_tasks() {
        let sched = Scheduler::new();
        assert_eq!(sched.pending(), 0);
        sched.schedule_after(|| {}, Duration::from_secs(60));
        assert_eq!(sched.pending(), 1);
    }
}
