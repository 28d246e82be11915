#![forbid(unsafe_code)]

//! Variable identity, modes, and the `Variable` trait.
//!
//! A [`Variable`] is a named, typed source of an optional value that policy
//! logic reads through an evaluation context. Every variable carries a
//! [`VariableMode`] fixed at construction:
//!
//! - [`Const`](VariableMode::Const): the value never changes once available.
//! - [`Poll`](VariableMode::Poll): the value must be re-read after the
//!   embedded interval elapses.
//! - [`Async`](VariableMode::Async): changes are pushed through a
//!   [`ChangeNotifier`].
//!
//! # Invariants
//!
//! 1. A variable's [`VariableId`] is process-unique and never reused.
//! 2. `mode()` returns the same value for the lifetime of the variable.
//! 3. `read()` never blocks and is idempotent; `None` means "no value yet",
//!    not an error.
//! 4. `notifier()` returns `Some` exactly for Async-mode variables.

use std::sync::atomic::{AtomicU64, Ordering};

use web_time::Duration;

use crate::notify::ChangeNotifier;

// ─── Variable identity ───────────────────────────────────────────────────────

static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a variable.
///
/// Evaluation contexts key their cache and consulted set by this id, so
/// identity is handle-based, never a deep value comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableId(u64);

impl VariableId {
    /// Allocate a fresh id. Ids are never reused within a process.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric form, for logging.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

// ─── Mode ────────────────────────────────────────────────────────────────────

/// How a variable's value evolves over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableMode {
    /// Fixed once available; never re-checked, never watched.
    Const,
    /// Must be re-read after `interval` elapses.
    Poll {
        /// Positive re-read interval.
        interval: Duration,
    },
    /// Changes are pushed via observer notification.
    Async,
}

impl VariableMode {
    /// The poll interval, for Poll-mode variables.
    #[must_use]
    pub fn poll_interval(&self) -> Option<Duration> {
        match self {
            Self::Poll { interval } => Some(*interval),
            Self::Const | Self::Async => None,
        }
    }
}

// ─── Metadata ────────────────────────────────────────────────────────────────

/// Immutable per-variable metadata: identity, name, and mode.
///
/// Variable implementations embed one of these and hand it out via
/// [`Variable::meta`]. Construction allocates the id.
#[derive(Debug)]
pub struct VariableMeta {
    id: VariableId,
    name: String,
    mode: VariableMode,
}

impl VariableMeta {
    /// Create metadata for a new variable. Panics in debug builds if a
    /// Poll-mode interval is zero (the contract requires a positive duration).
    #[must_use]
    pub fn new(name: impl Into<String>, mode: VariableMode) -> Self {
        if let VariableMode::Poll { interval } = mode {
            debug_assert!(!interval.is_zero(), "poll interval must be positive");
        }
        Self {
            id: VariableId::next(),
            name: name.into(),
            mode,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> VariableId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn mode(&self) -> VariableMode {
        self.mode
    }

    /// The poll interval, for Poll-mode variables.
    #[must_use]
    pub fn poll_interval(&self) -> Option<Duration> {
        self.mode.poll_interval()
    }
}

// ─── Variable trait ──────────────────────────────────────────────────────────

/// A named, typed, mode-tagged source of an optional value.
///
/// Implementations must keep `read()` non-blocking and side-effect free
/// beyond whatever the underlying source requires; an evaluation context may
/// call it repeatedly.
pub trait Variable {
    /// The value type this variable produces.
    type Value: Clone + 'static;

    /// Identity, name, and mode.
    fn meta(&self) -> &VariableMeta;

    /// Current value, or `None` if nothing is available yet.
    fn read(&self) -> Option<Self::Value>;

    /// Change notifier for Async-mode variables.
    ///
    /// The default is `None`; Async implementations override this. Observers
    /// are notified once per logical change and must `read()` again for the
    /// new value; the notification itself carries nothing.
    fn notifier(&self) -> Option<&ChangeNotifier> {
        None
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
