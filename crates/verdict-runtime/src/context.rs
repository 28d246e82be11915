#![forbid(unsafe_code)]

//! Per-evaluation cache and single-shot wake-up scheduling.
//!
//! An [`EvaluationContext`] gives one policy evaluation pass a consistent
//! snapshot of every variable it reads, and a way to be woken exactly when
//! any of those variables might be worth re-reading:
//!
//! - [`value_of`](EvaluationContext::value_of) reads a variable through a
//!   type-erased cache keyed by variable identity. The first present value
//!   captured for a variable is the value every later read in this context
//!   observes, no matter how the source changes afterwards.
//! - [`run_on_change_or_timeout`](EvaluationContext::run_on_change_or_timeout)
//!   arms a single-shot wait over everything the evaluation consulted:
//!   a change notification from any Async variable, or the minimum poll
//!   interval elapsing, whichever comes first.
//!
//! # Architecture
//!
//! The context is a cheaply cloneable handle over `Rc<ContextInner>`.
//! Observer callbacks and the timeout callback hold only `Weak` references
//! to the inner state, so the run loop and watched variables never keep a
//! context alive. When the last caller handle drops, the armed state's
//! subscription and timeout guards drop with it: every registration the
//! context owns is released synchronously, and the stored continuation is
//! discarded uninvoked.
//!
//! # Invariants
//!
//! 1. At most one continuation is pending at any time; arming while armed
//!    is rejected.
//! 2. Whichever trigger runs first releases every observer registration and
//!    cancels the timeout before the continuation can run; the losing
//!    trigger observes the idle state and is a no-op.
//! 3. Const-mode variables are never watched; neither is any variable the
//!    evaluation did not consult.
//! 4. An absent read result is never cached; each read retries the source
//!    until a present value is captured.
//! 5. The continuation runs from run-loop dispatch, strictly after
//!    registration returned, exactly once.
//!
//! # Failure Modes
//!
//! - **Consulted Async variable dropped before arming**: its notifier is
//!   gone; the variable contributes nothing to the watch set. If nothing
//!   else is watchable, arming reports `false`.
//! - **Both triggers become ready in the same pump**: the first dispatched
//!   callback wins; the second finds the wait idle.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;
use tracing::{debug, trace};
use web_time::Duration;

use verdict_core::notify::{ChangeNotifier, Subscription, WeakNotifier};
use verdict_core::variable::{Variable, VariableId, VariableMode};

use crate::run_loop::{RunLoop, Timeout};

type Continuation = Box<dyn FnOnce()>;

// ─── Consulted set ───────────────────────────────────────────────────────────

/// What the context remembers about a variable it consulted: enough to build
/// the watch set later, without owning the variable.
struct Consulted {
    name: String,
    mode: VariableMode,
    /// Non-owning hook to the variable's notifier (Async mode only).
    notifier: Option<WeakNotifier>,
}

// ─── Wait state machine ──────────────────────────────────────────────────────

/// Why the wait fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    ValueChanged,
    Timeout,
}

/// State owned by an armed wait. Dropping it releases every registration:
/// subscription guards unregister the observers, the timeout guard cancels
/// the timer.
struct ArmedWait {
    continuation: Continuation,
    subscriptions: Vec<Subscription>,
    timeout: Option<Timeout>,
}

enum WaitState {
    Idle,
    Armed(ArmedWait),
}

// ─── Context ─────────────────────────────────────────────────────────────────

struct ContextInner {
    run_loop: RunLoop,
    /// Captured values, keyed by variable identity. Present values only.
    cache: RefCell<AHashMap<VariableId, Box<dyn Any>>>,
    /// Every variable this evaluation touched, present value or not.
    consulted: RefCell<AHashMap<VariableId, Consulted>>,
    wait: RefCell<WaitState>,
}

/// Per-evaluation cache plus single-shot wake-up scheduler.
///
/// Clone freely within an evaluation pass; all clones share the same cache
/// and wait state. Variables are borrowed for the duration of each call and
/// never owned; a context outliving its variables degrades gracefully
/// instead of dangling.
#[derive(Clone)]
pub struct EvaluationContext {
    inner: Rc<ContextInner>,
}

impl std::fmt::Debug for EvaluationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationContext")
            .field("cached", &self.inner.cache.borrow().len())
            .field("consulted", &self.inner.consulted.borrow().len())
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl EvaluationContext {
    /// Create a context for one evaluation pass, dispatching its wake-ups
    /// through `run_loop`.
    #[must_use]
    pub fn new(run_loop: &RunLoop) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                run_loop: run_loop.clone(),
                cache: RefCell::new(AHashMap::new()),
                consulted: RefCell::new(AHashMap::new()),
                wait: RefCell::new(WaitState::Idle),
            }),
        }
    }

    /// Read `variable` through the context's cache.
    ///
    /// The first call that observes a present value captures it; every later
    /// call returns the captured value regardless of source changes. An
    /// absent result is returned but never cached, so a later call re-reads
    /// the source. Either way the variable joins the consulted set and will
    /// participate in the next wait's watch set.
    pub fn value_of<V: Variable>(&self, variable: &V) -> Option<V::Value> {
        let meta = variable.meta();
        let id = meta.id();

        self.inner
            .consulted
            .borrow_mut()
            .entry(id)
            .or_insert_with(|| Consulted {
                name: meta.name().to_string(),
                mode: meta.mode(),
                notifier: variable.notifier().map(|notifier| notifier.downgrade()),
            });

        if let Some(slot) = self.inner.cache.borrow().get(&id) {
            return slot.downcast_ref::<V::Value>().cloned();
        }

        let Some(value) = variable.read() else {
            trace!(variable = meta.name(), "no value available");
            return None;
        };
        self.inner
            .cache
            .borrow_mut()
            .insert(id, Box::new(value.clone()));
        trace!(variable = meta.name(), "value captured");
        Some(value)
    }

    /// Arm a single-shot wait: run `continuation` once, on the next change
    /// notification from any consulted Async variable or after the minimum
    /// poll interval among consulted Poll variables, whichever comes first.
    ///
    /// Returns `false` without storing the continuation if a wait is already
    /// armed (the existing wait is left untouched) or if there is nothing to
    /// wait for. The two cases are distinguishable via
    /// [`is_armed`](Self::is_armed).
    pub fn run_on_change_or_timeout(&self, continuation: impl FnOnce() + 'static) -> bool {
        let inner = &self.inner;
        if matches!(&*inner.wait.borrow(), WaitState::Armed(_)) {
            debug!("wait already armed; leaving it untouched");
            return false;
        }

        let (notifiers, min_interval) = inner.watch_set();
        if notifiers.is_empty() && min_interval.is_none() {
            debug!("nothing to wait for");
            return false;
        }

        let mut subscriptions = Vec::with_capacity(notifiers.len());
        for notifier in &notifiers {
            let weak = Rc::downgrade(inner);
            subscriptions.push(notifier.subscribe(move || {
                if let Some(ctx) = weak.upgrade() {
                    ctx.fire(Trigger::ValueChanged);
                }
            }));
        }
        let timeout = min_interval.map(|interval| {
            let weak = Rc::downgrade(inner);
            inner.run_loop.schedule_once(interval, move || {
                if let Some(ctx) = weak.upgrade() {
                    ctx.fire(Trigger::Timeout);
                }
            })
        });

        debug!(
            observers = subscriptions.len(),
            timeout = ?min_interval,
            "wait armed"
        );
        *inner.wait.borrow_mut() = WaitState::Armed(ArmedWait {
            continuation: Box::new(continuation),
            subscriptions,
            timeout,
        });
        true
    }

    /// Whether a continuation is currently pending a trigger.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        matches!(&*self.inner.wait.borrow(), WaitState::Armed(_))
    }
}

impl ContextInner {
    /// Collect the watch set from the consulted variables: live Async
    /// notifiers and the minimum Poll interval. Const variables and dead
    /// notifiers contribute nothing.
    fn watch_set(&self) -> (Vec<ChangeNotifier>, Option<Duration>) {
        let mut notifiers = Vec::new();
        let mut min_interval: Option<Duration> = None;
        for consulted in self.consulted.borrow().values() {
            match consulted.mode {
                VariableMode::Const => {}
                VariableMode::Poll { interval } => {
                    min_interval = Some(min_interval.map_or(interval, |cur| cur.min(interval)));
                }
                VariableMode::Async => {
                    match consulted.notifier.as_ref().and_then(WeakNotifier::upgrade) {
                        Some(notifier) => notifiers.push(notifier),
                        None => trace!(
                            variable = %consulted.name,
                            "async variable gone; nothing to watch"
                        ),
                    }
                }
            }
        }
        (notifiers, min_interval)
    }

    /// First trigger wins: swap the wait to idle, release every registration,
    /// then hand the continuation to the run loop. A stale trigger finds the
    /// wait idle and does nothing.
    fn fire(&self, trigger: Trigger) {
        let armed = match std::mem::replace(&mut *self.wait.borrow_mut(), WaitState::Idle) {
            WaitState::Armed(armed) => armed,
            WaitState::Idle => {
                trace!(?trigger, "stale trigger ignored");
                return;
            }
        };
        // Observers unregister and the timer cancels before the continuation
        // can run or re-arm.
        drop(armed.subscriptions);
        drop(armed.timeout);
        debug!(?trigger, "wait fired");
        self.run_loop.post(armed.continuation);
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if matches!(self.wait.get_mut(), WaitState::Armed(_)) {
            trace!("context dropped while armed; discarding continuation");
        }
        // Field drop releases the armed state's guards: subscriptions
        // unregister from their variables, the timeout cancels.
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use verdict_core::clock::LabClock;
    use verdict_core::sources::{ConstVariable, PollVariable, PushVariable};

    fn lab_setup() -> (LabClock, RunLoop) {
        let clock = LabClock::new();
        let run_loop = RunLoop::lab(&clock);
        (clock, run_loop)
    }

    fn flag() -> (Rc<Cell<bool>>, impl FnOnce()) {
        let flag = Rc::new(Cell::new(false));
        let flag_clone = Rc::clone(&flag);
        (flag, move || flag_clone.set(true))
    }

    #[test]
    fn value_of_returns_current_value() {
        let (_clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        let var = ConstVariable::new("answer", 42);
        assert_eq!(ctx.value_of(&var), Some(42));
    }

    #[test]
    fn value_of_caches_first_present_value() {
        let (_clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        let var = PushVariable::new("conn");
        var.set("wifi");

        assert_eq!(ctx.value_of(&var), Some("wifi"));
        var.set("ethernet");
        // The captured snapshot wins for the context's lifetime.
        assert_eq!(ctx.value_of(&var), Some("wifi"));
        assert_eq!(var.read(), Some("ethernet"));
    }

    #[test]
    fn absent_result_is_not_cached() {
        let (_clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        let var = PushVariable::new("conn");

        assert_eq!(ctx.value_of(&var), None);
        var.set("wifi");
        assert_eq!(ctx.value_of(&var), Some("wifi"));
    }

    #[test]
    fn cache_holds_mixed_types() {
        let (_clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        let count = ConstVariable::new("count", 7u32);
        let label = ConstVariable::new("label", "hello".to_string());

        assert_eq!(ctx.value_of(&count), Some(7));
        assert_eq!(ctx.value_of(&label), Some("hello".to_string()));
        assert_eq!(ctx.value_of(&count), Some(7));
    }

    #[test]
    fn arm_fails_with_nothing_consulted() {
        let (_clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        assert!(!ctx.run_on_change_or_timeout(|| {}));
        assert!(!ctx.is_armed());
    }

    #[test]
    fn arm_fails_with_only_const_consulted() {
        let (_clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        let var = ConstVariable::new("board", "kukui");
        assert_eq!(ctx.value_of(&var), Some("kukui"));

        assert!(!ctx.run_on_change_or_timeout(|| {}));
        assert!(!ctx.is_armed());
        assert_eq!(run_loop.pending_timers(), 0);
    }

    #[test]
    fn arm_while_armed_is_rejected() {
        let (_clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        let var = PushVariable::<i32>::new("conn");
        ctx.value_of(&var);

        let (fired, cont) = flag();
        assert!(ctx.run_on_change_or_timeout(cont));
        assert!(ctx.is_armed());
        assert!(!ctx.run_on_change_or_timeout(|| panic!("second continuation must not run")));

        // The original wait still works.
        var.set(1);
        run_loop.run_until_idle();
        assert!(fired.get());
        assert!(!ctx.is_armed());
    }

    #[test]
    fn notification_fires_continuation_from_run_loop() {
        let (_clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        let var = PushVariable::new("conn");
        var.set("wifi");
        ctx.value_of(&var);

        let (fired, cont) = flag();
        assert!(ctx.run_on_change_or_timeout(cont));

        // Nothing runs before the notification.
        run_loop.run_until_idle();
        assert!(!fired.get());

        var.set("ethernet");
        // The continuation is posted, not invoked inline.
        assert!(!fired.get());
        run_loop.run_until_idle();
        assert!(fired.get());
    }

    #[test]
    fn repeated_notifications_collapse_to_one_invocation() {
        let (_clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        let var = PushVariable::new("conn");
        var.set(0);
        ctx.value_of(&var);

        let count = Rc::new(Cell::new(0u32));
        let count_clone = Rc::clone(&count);
        assert!(ctx.run_on_change_or_timeout(move || count_clone.set(count_clone.get() + 1)));

        var.set(1);
        var.set(2);
        run_loop.run_until_idle();
        assert_eq!(count.get(), 1);
        // The first notification already unsubscribed the context.
        assert_eq!(
            var.notifier().expect("async variable").observer_count(),
            0
        );
    }

    #[test]
    fn timeout_fires_after_min_poll_interval() {
        let (clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        let slow = PollVariable::new("slow", Duration::from_secs(10), || Some(1));
        let fast = PollVariable::new("fast", Duration::from_secs(2), || Some(2));
        ctx.value_of(&slow);
        ctx.value_of(&fast);

        let (fired, cont) = flag();
        assert!(ctx.run_on_change_or_timeout(cont));
        assert_eq!(run_loop.pending_timers(), 1);

        // The minimum interval governs: nothing at t=1s, fire at t=2s.
        clock.advance(Duration::from_secs(1));
        run_loop.run_until_idle();
        assert!(!fired.get());

        clock.advance(Duration::from_secs(1));
        run_loop.run_until_idle();
        assert!(fired.get());
        assert!(!ctx.is_armed());
    }

    #[test]
    fn rearm_after_fire_works() {
        let (clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        let var = PollVariable::new("poll", Duration::from_secs(1), || Some(1));
        ctx.value_of(&var);

        let (first, cont) = flag();
        assert!(ctx.run_on_change_or_timeout(cont));
        clock.advance(Duration::from_secs(1));
        run_loop.run_until_idle();
        assert!(first.get());

        let (second, cont) = flag();
        assert!(ctx.run_on_change_or_timeout(cont));
        clock.advance(Duration::from_secs(1));
        run_loop.run_until_idle();
        assert!(second.get());
    }

    #[test]
    fn dead_async_variable_contributes_nothing() {
        let (_clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        {
            let var = PushVariable::<i32>::new("short_lived");
            ctx.value_of(&var);
        }
        // The only consulted variable is gone; nothing to watch.
        assert!(!ctx.run_on_change_or_timeout(|| {}));
        assert!(!ctx.is_armed());
    }

    #[test]
    fn continuation_can_rearm_the_same_context() {
        let (clock, run_loop) = lab_setup();
        let ctx = EvaluationContext::new(&run_loop);
        let var = PollVariable::new("poll", Duration::from_secs(1), || Some(1));
        ctx.value_of(&var);

        let rounds = Rc::new(Cell::new(0u32));
        let rounds_clone = Rc::clone(&rounds);
        let ctx_clone = ctx.clone();
        assert!(ctx.run_on_change_or_timeout(move || {
            rounds_clone.set(rounds_clone.get() + 1);
            let rounds_inner = Rc::clone(&rounds_clone);
            assert!(ctx_clone.run_on_change_or_timeout(move || {
                rounds_inner.set(rounds_inner.get() + 1);
            }));
        }));

        clock.advance(Duration::from_secs(1));
        run_loop.run_until_idle();
        assert_eq!(rounds.get(), 1);

        clock.advance(Duration::from_secs(1));
        run_loop.run_until_idle();
        assert_eq!(rounds.get(), 2);
    }
}
