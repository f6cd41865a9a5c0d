//! State codec: calls, continuation frames and the method table.
//!
//! A job's progress is captured as an explicit `(state, stack)` pair rather
//! than a language-level coroutine, so any worker holding the same
//! [`MethodTable`] can pick it up.

mod call;
mod method;

pub use call::{dump_call, dump_stack, load_call, load_stack, Call, Extra, Frame, Kwargs, State};
pub use method::{
    HandlerResult, JobContext, JobException, MethodTable, RunResult, Step,
};
