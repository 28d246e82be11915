#![forbid(unsafe_code)]

//! Change notification with RAII subscription guards.
//!
//! [`ChangeNotifier`] is the observer list an Async-mode variable owns.
//! Subscribers are stored as `Weak` callbacks and cleaned up lazily during
//! notification; a [`Subscription`] guard keeps its callback alive and
//! unregisters it on drop, so release is never an optional, forgettable step.
//!
//! # Invariants
//!
//! 1. Subscribers are notified in registration order.
//! 2. Each live subscriber is invoked exactly once per [`notify()`] call.
//! 3. Dropping a [`Subscription`] removes the callback before the next
//!    notification cycle.
//! 4. The notification carries no value; observers re-read the source.
//! 5. A [`WeakNotifier`] never extends the notifier's lifetime.
//!
//! # Failure Modes
//!
//! - **Subscriber drops its own guard during `notify()`**: the in-flight
//!   snapshot keeps the callback alive for the current cycle; it is gone
//!   from the next one.
//! - **Notifier dropped while subscriptions exist**: the guards become
//!   inert; dropping them later is a no-op.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

type ObserverFn = dyn Fn();

#[derive(Default)]
struct NotifierInner {
    /// Weak handles to subscriber callbacks, in registration order.
    /// Dead entries are pruned lazily on notify / count.
    subscribers: RefCell<Vec<Weak<ObserverFn>>>,
}

/// Shared observer list for one variable. Cheap to clone; all clones refer
/// to the same subscriber set.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    inner: Rc<NotifierInner>,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl ChangeNotifier {
    /// Create an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a change observer.
    ///
    /// The observer stays registered for as long as the returned guard is
    /// alive; dropping the guard unregisters it.
    #[must_use]
    pub fn subscribe(&self, observer: impl Fn() + 'static) -> Subscription {
        let callback: Rc<ObserverFn> = Rc::new(observer);
        self.inner
            .subscribers
            .borrow_mut()
            .push(Rc::downgrade(&callback));
        Subscription {
            _callback: callback,
        }
    }

    /// Notify every live subscriber of a logical change.
    ///
    /// Dead entries are pruned as a side effect. Callbacks run outside the
    /// subscriber-list borrow, so a callback may subscribe, drop guards, or
    /// re-enter `notify()` on another notifier.
    pub fn notify(&self) {
        let live: Vec<Rc<ObserverFn>> = {
            let mut subscribers = self.inner.subscribers.borrow_mut();
            subscribers.retain(|weak| weak.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };
        for callback in live {
            callback();
        }
    }

    /// Number of live subscribers. Prunes dead entries.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        let mut subscribers = self.inner.subscribers.borrow_mut();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.len()
    }

    /// A non-owning handle to this notifier.
    #[must_use]
    pub fn downgrade(&self) -> WeakNotifier {
        WeakNotifier {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

/// Non-owning handle to a [`ChangeNotifier`].
///
/// An evaluation context stores these for consulted Async variables so it
/// can register observers at arm time without extending the variable's
/// lifetime.
#[derive(Clone)]
pub struct WeakNotifier {
    inner: Weak<NotifierInner>,
}

impl WeakNotifier {
    /// Upgrade back to the notifier, if the variable is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<ChangeNotifier> {
        self.inner.upgrade().map(|inner| ChangeNotifier { inner })
    }
}

impl std::fmt::Debug for WeakNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakNotifier")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// RAII registration guard returned by [`ChangeNotifier::subscribe`].
///
/// Dropping the guard unregisters the observer before the next notification
/// cycle.
pub struct Subscription {
    _callback: Rc<ObserverFn>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Subscription")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn notify_reaches_subscriber() {
        let notifier = ChangeNotifier::new();
        let hits = Rc::new(Cell::new(0u32));
        let hits_clone = Rc::clone(&hits);
        let _sub = notifier.subscribe(move || hits_clone.set(hits_clone.get() + 1));

        notifier.notify();
        notifier.notify();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn drop_guard_unsubscribes() {
        let notifier = ChangeNotifier::new();
        let hits = Rc::new(Cell::new(0u32));
        let hits_clone = Rc::clone(&hits);
        let sub = notifier.subscribe(move || hits_clone.set(hits_clone.get() + 1));

        notifier.notify();
        assert_eq!(hits.get(), 1);

        drop(sub);
        notifier.notify();
        assert_eq!(hits.get(), 1);
        assert_eq!(notifier.observer_count(), 0);
    }

    #[test]
    fn observer_count_tracks_live_guards() {
        let notifier = ChangeNotifier::new();
        assert_eq!(notifier.observer_count(), 0);

        let a = notifier.subscribe(|| {});
        let b = notifier.subscribe(|| {});
        assert_eq!(notifier.observer_count(), 2);

        drop(a);
        assert_eq!(notifier.observer_count(), 1);
        drop(b);
        assert_eq!(notifier.observer_count(), 0);
    }

    #[test]
    fn notification_order_is_registration_order() {
        let notifier = ChangeNotifier::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = Rc::clone(&order);
        let _a = notifier.subscribe(move || o1.borrow_mut().push(1));
        let o2 = Rc::clone(&order);
        let _b = notifier.subscribe(move || o2.borrow_mut().push(2));

        notifier.notify();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn subscribe_during_notify_joins_next_cycle() {
        let notifier = ChangeNotifier::new();
        let late_hits = Rc::new(Cell::new(0u32));
        let keeper: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));

        let notifier_clone = notifier.clone();
        let keeper_clone = Rc::clone(&keeper);
        let late_clone = Rc::clone(&late_hits);
        let _sub = notifier.subscribe(move || {
            if keeper_clone.borrow().is_none() {
                let late = Rc::clone(&late_clone);
                let guard = notifier_clone.subscribe(move || late.set(late.get() + 1));
                *keeper_clone.borrow_mut() = Some(guard);
            }
        });

        // First cycle registers the late subscriber but must not invoke it.
        notifier.notify();
        assert_eq!(late_hits.get(), 0);

        notifier.notify();
        assert_eq!(late_hits.get(), 1);
    }

    #[test]
    fn weak_notifier_upgrade_follows_lifetime() {
        let weak;
        {
            let notifier = ChangeNotifier::new();
            weak = notifier.downgrade();
            assert!(weak.upgrade().is_some());
        }
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn guard_outliving_notifier_is_inert() {
        let sub;
        {
            let notifier = ChangeNotifier::new();
            sub = notifier.subscribe(|| {});
        }
        // Dropping after the notifier is gone must not panic.
        drop(sub);
    }

    #[test]
    fn clones_share_the_subscriber_set() {
        let notifier = ChangeNotifier::new();
        let clone = notifier.clone();
        let hits = Rc::new(Cell::new(0u32));
        let hits_clone = Rc::clone(&hits);
        let _sub = clone.subscribe(move || hits_clone.set(hits_clone.get() + 1));

        notifier.notify();
        assert_eq!(hits.get(), 1);
        assert_eq!(notifier.observer_count(), 1);
    }
}
