//! Console protocol primitives.

pub mod dispatcher;
pub mod pattern;

// Re-export common types
pub use dispatcher::{
    Command, DispatchTiming, Dispatcher, ETX, Exchange, Expect, InterruptCheck, SendMode,
};
pub use pattern::{compile, extract_all, extract_first, first_missing};
