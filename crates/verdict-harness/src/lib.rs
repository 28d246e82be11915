#![forbid(unsafe_code)]

//! Test harness and fixtures for the Verdict evaluation substrate.
//!
//! The central fixture is [`FakeVariable`]: a variable of any mode whose
//! value the test controls directly and whose change notifications fire only
//! when the test says so. Unlike production Async sources, setting a value
//! does **not** notify; tests call [`FakeVariable::notify_changed`]
//! explicitly to exercise the notification path and the value path
//! independently.
//!
//! Every `FakeVariable` owns a notifier regardless of mode, so tests can
//! assert that an evaluation context left zero observers behind on Const and
//! Poll variables too; the context must never have subscribed to them in
//! the first place.

use std::cell::RefCell;

use web_time::Duration;

use verdict_core::notify::ChangeNotifier;
use verdict_core::variable::{Variable, VariableMeta, VariableMode};

/// A controllable variable for tests: any mode, settable value, manual
/// notification.
#[derive(Debug)]
pub struct FakeVariable<T> {
    meta: VariableMeta,
    value: RefCell<Option<T>>,
    notifier: ChangeNotifier,
}

impl<T: Clone + 'static> FakeVariable<T> {
    /// Create a fake variable with no value.
    #[must_use]
    pub fn new(name: impl Into<String>, mode: VariableMode) -> Self {
        Self {
            meta: VariableMeta::new(name, mode),
            value: RefCell::new(None),
            notifier: ChangeNotifier::new(),
        }
    }

    /// Shorthand for a Poll-mode fake.
    #[must_use]
    pub fn polling(name: impl Into<String>, interval: Duration) -> Self {
        Self::new(name, VariableMode::Poll { interval })
    }

    /// Replace the current value. Does not notify.
    pub fn set(&self, value: T) {
        *self.value.borrow_mut() = Some(value);
    }

    /// Clear the current value. Does not notify.
    pub fn unset(&self) {
        *self.value.borrow_mut() = None;
    }

    /// Fire the change notifier, as the underlying source would.
    pub fn notify_changed(&self) {
        self.notifier.notify();
    }

    /// Number of live observers registered on this variable.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.notifier.observer_count()
    }
}

impl<T: Clone + 'static> Variable for FakeVariable<T> {
    type Value = T;

    fn meta(&self) -> &VariableMeta {
        &self.meta
    }

    fn read(&self) -> Option<T> {
        self.value.borrow().clone()
    }

    fn notifier(&self) -> Option<&ChangeNotifier> {
        match self.meta.mode() {
            VariableMode::Async => Some(&self.notifier),
            VariableMode::Const | VariableMode::Poll { .. } => None,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
