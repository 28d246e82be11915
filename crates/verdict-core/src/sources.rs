#![forbid(unsafe_code)]

//! Reusable variable sources: constant, polled, and pushed.
//!
//! These cover the common shapes policy inputs take:
//!
//! - [`ConstVariable`]: fixed at construction (board name, channel).
//! - [`PollVariable`]: re-read from a closure on an interval (battery level,
//!   free disk space).
//! - [`PushVariable`]: updated by its owner, notifying observers on each
//!   logical change (connection type, server-pushed config).
//!
//! # Invariants
//!
//! 1. `PushVariable::set` notifies only when the value actually changes;
//!    setting an equal value is a no-op.
//! 2. `PushVariable::unset` notifies only if a value was present.
//! 3. `PollVariable` readers are invoked on every `read()`; the evaluation
//!    context, not the variable, is responsible for caching.

use std::cell::RefCell;

use web_time::Duration;

use crate::notify::ChangeNotifier;
use crate::variable::{Variable, VariableMeta, VariableMode};

// ─── ConstVariable ───────────────────────────────────────────────────────────

/// A Const-mode variable whose value is supplied at construction.
#[derive(Debug)]
pub struct ConstVariable<T> {
    meta: VariableMeta,
    value: T,
}

impl<T: Clone + 'static> ConstVariable<T> {
    #[must_use]
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            meta: VariableMeta::new(name, VariableMode::Const),
            value,
        }
    }
}

impl<T: Clone + 'static> Variable for ConstVariable<T> {
    type Value = T;

    fn meta(&self) -> &VariableMeta {
        &self.meta
    }

    fn read(&self) -> Option<T> {
        Some(self.value.clone())
    }
}

// ─── PollVariable ────────────────────────────────────────────────────────────

/// A Poll-mode variable that re-reads its value from a closure.
///
/// The closure must be non-blocking and cheap; it is called on every
/// `read()`. Returning `None` means the value is not available yet.
pub struct PollVariable<T> {
    meta: VariableMeta,
    reader: Box<dyn Fn() -> Option<T>>,
}

impl<T: Clone + 'static> PollVariable<T> {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        reader: impl Fn() -> Option<T> + 'static,
    ) -> Self {
        Self {
            meta: VariableMeta::new(name, VariableMode::Poll { interval }),
            reader: Box::new(reader),
        }
    }
}

impl<T> std::fmt::Debug for PollVariable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollVariable")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> Variable for PollVariable<T> {
    type Value = T;

    fn meta(&self) -> &VariableMeta {
        &self.meta
    }

    fn read(&self) -> Option<T> {
        (self.reader)()
    }
}

// ─── PushVariable ────────────────────────────────────────────────────────────

/// An Async-mode variable updated by its owner.
///
/// Starts without a value. [`set`](PushVariable::set) stores a new value and
/// notifies observers if it differs from the current one;
/// [`unset`](PushVariable::unset) clears it.
#[derive(Debug)]
pub struct PushVariable<T> {
    meta: VariableMeta,
    value: RefCell<Option<T>>,
    notifier: ChangeNotifier,
}

impl<T: Clone + PartialEq + 'static> PushVariable<T> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: VariableMeta::new(name, VariableMode::Async),
            value: RefCell::new(None),
            notifier: ChangeNotifier::new(),
        }
    }

    /// Store `value` and notify observers if it differs from the current one.
    pub fn set(&self, value: T) {
        {
            let mut slot = self.value.borrow_mut();
            if slot.as_ref() == Some(&value) {
                return;
            }
            *slot = Some(value);
        }
        self.notifier.notify();
    }

    /// Clear the value; notifies observers if one was present.
    pub fn unset(&self) {
        let had_value = self.value.borrow_mut().take().is_some();
        if had_value {
            self.notifier.notify();
        }
    }
}

impl<T: Clone + PartialEq + 'static> Variable for PushVariable<T> {
    type Value = T;

    fn meta(&self) -> &VariableMeta {
        &self.meta
    }

    fn read(&self) -> Option<T> {
        self.value.borrow().clone()
    }

    fn notifier(&self) -> Option<&ChangeNotifier> {
        Some(&self.notifier)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
