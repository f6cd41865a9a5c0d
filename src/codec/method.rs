//! Method table and single-step execution of encoded calls.
//!
//! The table is code, not data: every worker process builds the same table
//! at startup, and only method names travel through the store.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::call::{dump_call, load_call, Call, Extra, Frame, Kwargs, State};
use crate::backend::CasStorage;
use crate::recovery::extract_panic_message;
use crate::types::{JobId, Result};

/// What a handler asks the engine to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The job (or the current nested call) is finished with this value.
    Return(Value),
    /// Suspension point: checkpoint, then continue with this call.
    Yield(Call),
    /// Push `then`, checkpoint, and run `call`; its return value resumes `then`.
    Call { call: Call, then: Frame },
}

/// A handler-level failure, stored as the job's terminal exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobException {
    pub kind: String,
    pub message: String,
}

impl JobException {
    pub const CANCELLED: &'static str = "cancelled";
    pub const PANIC: &'static str = "panic";
    pub const UNKNOWN_METHOD: &'static str = "unknown_method";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(Self::CANCELLED, "job was cancelled")
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == Self::CANCELLED
    }
}

impl fmt::Display for JobException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result type of a handler invocation.
pub type HandlerResult = std::result::Result<Step, JobException>;

type Handler = Arc<dyn Fn(Kwargs, JobContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Per-job context handed to handlers.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub extra: Arc<Extra>,
    storage: Arc<dyn CasStorage>,
}

impl JobContext {
    pub fn new(job_id: JobId, extra: Extra, storage: Arc<dyn CasStorage>) -> Self {
        Self {
            job_id,
            extra: Arc::new(extra),
            storage,
        }
    }

    /// Namespaced CAS storage for handler idempotency bookkeeping.
    pub fn storage(&self) -> &Arc<dyn CasStorage> {
        &self.storage
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("extra", &self.extra)
            .finish_non_exhaustive()
    }
}

/// Outcome of running one encoded call.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    Return(Value),
    Continue(State),
    Call { state: State, frame: Frame },
    Raised(JobException),
}

/// Maps method names to async handlers.
#[derive(Default, Clone)]
pub struct MethodTable {
    methods: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Kwargs, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |kwargs, ctx| handler(kwargs, ctx).boxed());
        self.methods.insert(name.into(), handler);
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    #[must_use]
    pub fn with<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Kwargs, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Decode `state`, invoke its method once and encode what comes next.
    ///
    /// Handler failures and panics become `RunResult::Raised`; only codec
    /// failures are returned as errors.
    pub async fn run(&self, state: &State, ctx: JobContext) -> Result<RunResult> {
        let call = load_call(state)?;
        let Some(handler) = self.methods.get(&call.method) else {
            return Ok(RunResult::Raised(JobException::new(
                JobException::UNKNOWN_METHOD,
                format!("no handler registered for {}", call.method),
            )));
        };

        let job_id = ctx.job_id.clone();
        let outcome = AssertUnwindSafe(handler(call.kwargs, ctx)).catch_unwind().await;

        let step = match outcome {
            Ok(Ok(step)) => step,
            Ok(Err(exception)) => return Ok(RunResult::Raised(exception)),
            Err(payload) => {
                let message = extract_panic_message(&payload);
                tracing::error!(job_id = %job_id, method = %call.method, panic = %message, "handler_panicked");
                return Ok(RunResult::Raised(JobException::new(JobException::PANIC, message)));
            }
        };

        Ok(match step {
            Step::Return(value) => RunResult::Return(value),
            Step::Yield(next) => RunResult::Continue(dump_call(&next.method, &next.kwargs)?),
            Step::Call { call, then } => RunResult::Call {
                state: dump_call(&call.method, &call.kwargs)?,
                frame: then,
            },
        })
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}
