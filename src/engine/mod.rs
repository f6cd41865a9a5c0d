//! Job execution engine.
//!
//! A [`JobThread`] drives one claimed job step by step: run the current call,
//! checkpoint the next continuation, repeat until the job returns or raises.

mod state;
mod thread;

pub use state::JobState;
pub use thread::JobThread;
