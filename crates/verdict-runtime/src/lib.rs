#![forbid(unsafe_code)]

//! Runtime: cooperative run loop and the per-evaluation context.

pub mod context;
pub mod run_loop;

pub use context::EvaluationContext;
pub use run_loop::{RunLoop, Timeout};
