#![forbid(unsafe_code)]

//! Single-threaded cooperative run loop: posted tasks and one-shot timers.
//!
//! The loop performs no threading of its own. Work is dispatched only when a
//! caller pumps it via [`run_until_idle`](RunLoop::run_until_idle) (or
//! [`run_for`](RunLoop::run_for)), so timer callbacks, observer deliveries,
//! and continuations all run on the pumping thread, one task at a time.
//!
//! # Invariants
//!
//! 1. Posted tasks run in FIFO order, before any due timer.
//! 2. Due timers run in deadline order; a timer fires at most once.
//! 3. Dropping a [`Timeout`] guard cancels the timer if it has not fired.
//! 4. Tasks may post, schedule, or cancel freely; the queue is never
//!    borrowed while a task runs.
//!
//! # Failure Modes
//!
//! - **Cancel after fire**: the entry is already consumed; cancellation is a
//!   no-op.
//! - **Guard outlives the loop**: the guard's weak handle is dead; dropping
//!   it is a no-op.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tracing::trace;
use web_time::{Duration, Instant};

use verdict_core::clock::{Clock, LabClock};

type Task = Box<dyn FnOnce()>;

struct TimerEntry {
    id: u64,
    deadline: Instant,
    task: Task,
}

#[derive(Default)]
struct LoopCore {
    posted: VecDeque<Task>,
    timers: Vec<TimerEntry>,
    next_timer_id: u64,
}

impl LoopCore {
    /// Pop the next runnable task: posted first, then the earliest due timer.
    fn pop_runnable(&mut self, now: Instant) -> Option<Task> {
        if let Some(task) = self.posted.pop_front() {
            return Some(task);
        }
        let due = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.deadline <= now)
            .min_by_key(|(_, entry)| entry.deadline)
            .map(|(index, _)| index)?;
        Some(self.timers.remove(due).task)
    }
}

/// Cooperative dispatcher shared by an evaluation pass.
///
/// Cheap to clone; all clones share the same queue and clock.
#[derive(Clone)]
pub struct RunLoop {
    core: Rc<RefCell<LoopCore>>,
    clock: Clock,
}

impl std::fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLoop")
            .field("pending_tasks", &self.pending_tasks())
            .field("pending_timers", &self.pending_timers())
            .field("clock", &self.clock)
            .finish()
    }
}

impl RunLoop {
    /// Create a run loop over the real wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Clock::Real)
    }

    /// Create a run loop over an explicit time source.
    #[must_use]
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            core: Rc::new(RefCell::new(LoopCore::default())),
            clock,
        }
    }

    /// Create a run loop driven by a shared [`LabClock`] for deterministic
    /// tests.
    #[must_use]
    pub fn lab(clock: &LabClock) -> Self {
        Self::with_clock(Clock::Lab(clock.clone()))
    }

    /// The loop's time source.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Enqueue a task to run on the next pump.
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.core.borrow_mut().posted.push_back(Box::new(task));
    }

    /// Schedule `task` to run once `delay` has elapsed on the loop's clock.
    ///
    /// The returned guard cancels the timer when dropped; keep it alive for
    /// as long as the timer should stay pending.
    #[must_use]
    pub fn schedule_once(&self, delay: Duration, task: impl FnOnce() + 'static) -> Timeout {
        let deadline = self.clock.now() + delay;
        let mut core = self.core.borrow_mut();
        let id = core.next_timer_id;
        core.next_timer_id += 1;
        core.timers.push(TimerEntry {
            id,
            deadline,
            task: Box::new(task),
        });
        trace!(timer = id, ?delay, "timer scheduled");
        Timeout {
            id,
            core: Rc::downgrade(&self.core),
        }
    }

    /// Dispatch posted tasks and due timers until none remain runnable.
    ///
    /// Work enqueued by a running task participates in the same pump if it
    /// is runnable. Returns the number of tasks dispatched.
    pub fn run_until_idle(&self) -> usize {
        let mut dispatched = 0;
        loop {
            let now = self.clock.now();
            let task = self.core.borrow_mut().pop_runnable(now);
            match task {
                Some(task) => {
                    task();
                    dispatched += 1;
                }
                None => break,
            }
        }
        dispatched
    }

    /// Pump the loop for `duration` of its clock's time.
    ///
    /// On a real clock this sleeps in small chunks between pumps; on a lab
    /// clock it advances the clock instead, so pending timers come due
    /// deterministically. Returns the number of tasks dispatched.
    pub fn run_for(&self, duration: Duration) -> usize {
        let chunk = Duration::from_millis(10);
        let deadline = self.clock.now() + duration;
        let mut dispatched = self.run_until_idle();
        loop {
            let now = self.clock.now();
            if now >= deadline {
                break;
            }
            let step = chunk.min(deadline - now);
            match &self.clock {
                Clock::Real => std::thread::sleep(step),
                Clock::Lab(lab) => lab.advance(step),
            }
            dispatched += self.run_until_idle();
        }
        dispatched
    }

    /// Number of tasks waiting in the posted queue.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.core.borrow().posted.len()
    }

    /// Number of timers that have neither fired nor been cancelled.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.core.borrow().timers.len()
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Timeout guard ───────────────────────────────────────────────────────────

/// RAII guard for a pending one-shot timer.
///
/// Dropping the guard cancels the timer if it has not fired yet. Holds only
/// a weak handle to the loop, so a guard outliving its loop is inert.
pub struct Timeout {
    id: u64,
    core: Weak<RefCell<LoopCore>>,
}

impl Timeout {
    /// Cancel the timer explicitly. Equivalent to dropping the guard.
    pub fn cancel(self) {
        // Drop does the work.
    }

    /// Whether the timer is still waiting to fire.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.borrow().timers.iter().any(|entry| entry.id == self.id))
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            let mut core = core.borrow_mut();
            let before = core.timers.len();
            core.timers.retain(|entry| entry.id != self.id);
            if core.timers.len() != before {
                trace!(timer = self.id, "timer cancelled");
            }
        }
    }
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout")
            .field("id", &self.id)
            .field("pending", &self.is_pending())
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
