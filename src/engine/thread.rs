//! Worker-side execution of a single claimed job.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use super::state::JobState;
use crate::backend::{CasStorage, Checkpoint, ClaimedJob, JobEnd, JobLease, JobsProcess};
use crate::codec::{dump_stack, load_stack, Extra, Frame, JobContext, JobException, MethodTable, RunResult, State};
use crate::types::{Error, JobId, Result};

/// A job being driven by one worker.
///
/// Every suspension point is persisted through `save_job_state` before the
/// next step runs, and the outcome is reported through `done_job` exactly
/// once. A backend error abandons the thread; the persisted record then
/// reflects the last successful checkpoint.
pub struct JobThread {
    job_id: JobId,
    lease: Option<JobLease>,
    state: JobState,
    current: Option<State>,
    stack: Vec<Frame>,
    ctx: Option<JobContext>,
    storage: Arc<dyn CasStorage>,
    methods: Arc<MethodTable>,
    backend: Arc<dyn JobsProcess>,
    steps: u64,
    end: Option<JobEnd>,
}

impl JobThread {
    pub fn new(
        lease: JobLease,
        methods: Arc<MethodTable>,
        backend: Arc<dyn JobsProcess>,
        storage: Arc<dyn CasStorage>,
    ) -> Self {
        Self {
            job_id: lease.job_id.clone(),
            lease: Some(lease),
            state: JobState::Created,
            current: None,
            stack: Vec::new(),
            ctx: None,
            storage,
            methods,
            backend,
            steps: 0,
            end: None,
        }
    }

    /// Build a thread for a claimed job, starting or resuming as appropriate.
    pub fn from_claim(
        claimed: ClaimedJob,
        methods: Arc<MethodTable>,
        backend: Arc<dyn JobsProcess>,
        storage: Arc<dyn CasStorage>,
    ) -> Result<Self> {
        let ClaimedJob {
            lease,
            state,
            stack,
            extra,
            resumed,
        } = claimed;
        let mut thread = Self::new(lease, methods, backend, storage);
        if resumed {
            thread.resume(state, &stack, extra)?;
        } else {
            thread.start(state, extra)?;
        }
        Ok(thread)
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn end(&self) -> Option<&JobEnd> {
        self.end.as_ref()
    }

    /// Record version of the last write made through this thread.
    pub fn version(&self) -> Option<u64> {
        self.lease.as_ref().map(|lease| lease.version)
    }

    /// Begin a fresh job from its initial call.
    pub fn start(&mut self, initial_state: State, extra: Extra) -> Result<()> {
        self.transition(JobState::Running)?;
        self.current = Some(initial_state);
        self.stack.clear();
        self.ctx = Some(JobContext::new(self.job_id.clone(), extra, Arc::clone(&self.storage)));
        tracing::info!(job_id = %self.job_id, "job_started");
        Ok(())
    }

    /// Continue a job from its last checkpoint.
    pub fn resume(&mut self, state: State, stack: &[u8], extra: Extra) -> Result<()> {
        let frames = load_stack(stack)?;
        self.transition(JobState::Running)?;
        self.current = Some(state);
        self.stack = frames;
        self.ctx = Some(JobContext::new(self.job_id.clone(), extra, Arc::clone(&self.storage)));
        tracing::info!(job_id = %self.job_id, depth = self.stack.len(), "job_resumed");
        Ok(())
    }

    /// Run the current call once and persist whatever comes next.
    ///
    /// Returns the state after the step. Backend errors abandon the thread
    /// and are returned to the caller.
    pub async fn step(&mut self) -> Result<JobState> {
        if self.state == JobState::Suspended {
            self.transition(JobState::Running)?;
        }
        if self.state != JobState::Running {
            return Err(Error::state_transition(format!(
                "job {} cannot step from {:?}",
                self.job_id, self.state
            )));
        }
        let (Some(current), Some(ctx)) = (self.current.clone(), self.ctx.clone()) else {
            return Err(Error::internal(format!("job {} has no current call", self.job_id)));
        };

        self.steps += 1;
        let job_id = self.job_id.clone();
        let run = self.methods.run(&current, ctx).await;
        let outcome = match run {
            Ok(outcome) => outcome,
            // A state that cannot be decoded will never run anywhere.
            Err(Error::Encoding(message)) => RunResult::Raised(JobException::new("encoding", message)),
            Err(e) => return Err(self.abandon(e)),
        };

        match outcome {
            RunResult::Return(value) => match self.stack.pop() {
                None => self.finish(JobEnd::returned(job_id, value)).await?,
                Some(frame) => {
                    let resumed = frame.resume_with(value);
                    match resumed.dump() {
                        Ok(next) => {
                            self.current = Some(next);
                            self.checkpoint().await?;
                        }
                        Err(e) => {
                            let exception = JobException::new("encoding", e.to_string());
                            self.finish(JobEnd::raised(job_id, exception)).await?;
                        }
                    }
                }
            },
            RunResult::Continue(next) => {
                self.current = Some(next);
                self.checkpoint().await?;
            }
            RunResult::Call { state, frame } => {
                self.stack.push(frame);
                self.current = Some(state);
                self.checkpoint().await?;
            }
            RunResult::Raised(exception) => {
                tracing::info!(job_id = %job_id, exception = %exception, "job_raised");
                self.finish(JobEnd::raised(job_id, exception)).await?;
            }
        }
        Ok(self.state)
    }

    /// Persist the current `(state, stack)` and suspend.
    ///
    /// Re-checkpointing an unchanged continuation writes byte-identical
    /// state. If the reply carries a cancel request the job ends as cancelled.
    pub async fn checkpoint(&mut self) -> Result<Checkpoint> {
        if !matches!(self.state, JobState::Running | JobState::Suspended) {
            return Err(Error::state_transition(format!(
                "job {} cannot checkpoint from {:?}",
                self.job_id, self.state
            )));
        }
        let Some(current) = self.current.clone() else {
            return Err(Error::internal(format!("job {} has no current call", self.job_id)));
        };
        let stack: Bytes = dump_stack(&self.stack)?;
        let Some(lease) = self.lease.as_mut() else {
            return Err(Error::internal(format!("job {} has no lease", self.job_id)));
        };

        let saved = self.backend.save_job_state(lease, &current, &stack).await;
        let checkpoint = match saved {
            Ok(checkpoint) => checkpoint,
            Err(e) => return Err(self.abandon(e)),
        };
        if self.state == JobState::Running {
            self.transition(JobState::Suspended)?;
        }
        tracing::debug!(
            job_id = %self.job_id,
            version = checkpoint.version,
            depth = self.stack.len(),
            "job_suspended"
        );

        if checkpoint.cancel_requested {
            tracing::info!(job_id = %self.job_id, "job_cancel_observed");
            let job_id = self.job_id.clone();
            self.finish(JobEnd::cancelled(job_id)).await?;
        }
        Ok(checkpoint)
    }

    /// Step until the job ends.
    pub async fn run_to_end(&mut self) -> Result<JobEnd> {
        while !self.state.is_terminal() {
            self.step().await?;
        }
        self.end
            .clone()
            .ok_or_else(|| Error::internal(format!("job {} ended without an outcome", self.job_id)))
    }

    /// Hand the job back to the pool without finishing it.
    pub async fn release(mut self) -> Result<()> {
        if matches!(self.state, JobState::Done | JobState::Failed) {
            return Ok(());
        }
        match self.lease.take() {
            Some(lease) => self.backend.release(lease).await,
            None => Ok(()),
        }
    }

    async fn finish(&mut self, end: JobEnd) -> Result<()> {
        let target = match end.status() {
            crate::backend::JobStatus::Done => JobState::Done,
            _ => JobState::Failed,
        };
        if self.end.is_some() || !self.state.can_transition_to(target) {
            return Err(Error::state_transition(format!(
                "job {} cannot end from {:?}",
                self.job_id, self.state
            )));
        }
        let Some(lease) = self.lease.as_mut() else {
            return Err(Error::internal(format!("job {} has no lease", self.job_id)));
        };

        let reported = self.backend.done_job(lease, end.clone()).await;
        if let Err(e) = reported {
            return Err(self.abandon(e));
        }
        self.state = target;
        tracing::info!(job_id = %self.job_id, state = ?target, steps = self.steps, "job_finished");
        self.end = Some(end);
        Ok(())
    }

    fn transition(&mut self, to: JobState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::state_transition(format!(
                "job {}: {:?} -> {:?}",
                self.job_id, self.state, to
            )));
        }
        tracing::trace!(job_id = %self.job_id, from = ?self.state, to = ?to, "job_transition");
        self.state = to;
        Ok(())
    }

    fn abandon(&mut self, err: Error) -> Error {
        tracing::warn!(job_id = %self.job_id, state = ?self.state, error = %err, "job_abandoned");
        self.state = JobState::Abandoned;
        err
    }
}

impl fmt::Debug for JobThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobThread")
            .field("job_id", &self.job_id)
            .field("state", &self.state)
            .field("depth", &self.stack.len())
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, JobRecord, JobStatus, JobsControl};
    use crate::codec::{Call, Frame, HandlerResult, Kwargs, Step};
    use crate::store::{CasStore, MemoryStore};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn int(kwargs: &Kwargs, name: &str) -> i64 {
        kwargs.get(name).and_then(Value::as_i64).unwrap_or(0)
    }

    fn encode(call: std::result::Result<Call, Error>) -> std::result::Result<Call, JobException> {
        call.map_err(|e| JobException::new("encoding", e.to_string()))
    }

    /// `sum(n)` adds 1..=n one checkpoint at a time; `twice(x)` calls
    /// `sum(n=x)` and doubles the result in a continuation frame.
    fn methods() -> Arc<MethodTable> {
        Arc::new(
            MethodTable::new()
                .with("sum", |kwargs, _ctx| async move { sum_step(kwargs) })
                .with("twice", |kwargs, _ctx| async move { twice_step(kwargs) })
                .with("double", |kwargs, _ctx| async move {
                    Ok(Step::Return(json!(int(&kwargs, "value") * 2)))
                })
                .with("fail", |_kwargs, _ctx| async move {
                    Err(JobException::new("value_error", "nope"))
                }),
        )
    }

    fn sum_step(kwargs: Kwargs) -> HandlerResult {
        let (n, i, acc) = (int(&kwargs, "n"), int(&kwargs, "i"), int(&kwargs, "acc"));
        if i >= n {
            return Ok(Step::Return(json!(acc)));
        }
        let next = encode(
            Call::new("sum")
                .arg("n", &n)
                .and_then(|c| c.arg("i", &(i + 1)))
                .and_then(|c| c.arg("acc", &(acc + i + 1))),
        )?;
        Ok(Step::Yield(next))
    }

    fn twice_step(kwargs: Kwargs) -> HandlerResult {
        let call = encode(Call::new("sum").arg("n", &int(&kwargs, "x")))?;
        Ok(Step::Call {
            call,
            then: Frame::new(Call::new("double"), "value"),
        })
    }

    struct Harness {
        backend: Backend<MemoryStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                backend: Backend::new(Arc::new(MemoryStore::new())),
            }
        }

        async fn claim(&self, call: Call) -> JobThread {
            let job_id = self.backend.submit(call, Extra::new()).await.unwrap();
            self.claim_id(&job_id).await
        }

        async fn claim_id(&self, job_id: &JobId) -> JobThread {
            let session = self.backend.store().open_session(Duration::from_secs(30)).await.unwrap();
            let claimed = self.backend.claim(job_id, &session).await.unwrap().unwrap();
            JobThread::from_claim(
                claimed,
                methods(),
                Arc::new(self.backend.clone()),
                self.backend.cas_storage(),
            )
            .unwrap()
        }

        async fn record(&self, job_id: &JobId) -> (JobRecord, u64) {
            self.backend.get(job_id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_start_requires_created() {
        let harness = Harness::new();
        let mut thread = harness.claim(Call::new("sum")).await;
        assert_eq!(thread.state(), JobState::Running);
        let err = thread.start(Call::new("sum").dump().unwrap(), Extra::new()).unwrap_err();
        assert!(matches!(err, Error::StateTransition(_)));
    }

    #[tokio::test]
    async fn test_each_suspension_is_checkpointed() {
        let harness = Harness::new();
        let mut thread = harness.claim(Call::new("sum").arg("n", &3).unwrap()).await;
        let job_id = thread.job_id().clone();
        let start_version = thread.version().unwrap();

        assert_eq!(thread.step().await.unwrap(), JobState::Suspended);
        let (record, version) = harness.record(&job_id).await;
        assert_eq!(version, start_version + 1);
        assert_eq!(record.checkpoints, 1);
        let persisted = crate::codec::load_call(&State::from_bytes(record.state)).unwrap();
        assert_eq!(persisted.kwargs.get("acc"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_run_to_end_reports_once() {
        let harness = Harness::new();
        let mut thread = harness.claim(Call::new("sum").arg("n", &4).unwrap()).await;
        let end = thread.run_to_end().await.unwrap();
        assert_eq!(end.return_value, Some(json!(10)));
        assert_eq!(thread.state(), JobState::Done);

        let (record, _) = harness.record(thread.job_id()).await;
        assert_eq!(record.status, JobStatus::Done);
        assert_eq!(record.checkpoints, 4);

        assert!(matches!(thread.step().await, Err(Error::StateTransition(_))));
    }

    #[tokio::test]
    async fn test_nested_call_resumes_frame() {
        let harness = Harness::new();
        let mut thread = harness.claim(Call::new("twice").arg("x", &3).unwrap()).await;

        thread.step().await.unwrap();
        assert_eq!(thread.stack_depth(), 1);

        let end = thread.run_to_end().await.unwrap();
        assert_eq!(end.return_value, Some(json!(12)));
        assert_eq!(thread.stack_depth(), 0);
    }

    #[tokio::test]
    async fn test_raised_exception_fails_job() {
        let harness = Harness::new();
        let mut thread = harness.claim(Call::new("fail")).await;
        assert_eq!(thread.step().await.unwrap(), JobState::Failed);
        let end = harness.backend.result(thread.job_id()).await.unwrap().unwrap();
        assert_eq!(end.exception, Some(JobException::new("value_error", "nope")));
    }

    #[tokio::test]
    async fn test_checkpoint_is_idempotent() {
        let harness = Harness::new();
        let mut thread = harness.claim(Call::new("sum").arg("n", &5).unwrap()).await;
        let job_id = thread.job_id().clone();
        thread.step().await.unwrap();
        let (first, v1) = harness.record(&job_id).await;

        let checkpoint = thread.checkpoint().await.unwrap();
        let (second, v2) = harness.record(&job_id).await;
        assert_eq!(checkpoint.version, v2);
        assert!(v2 > v1);
        assert_eq!(first.state, second.state);
        assert_eq!(first.stack, second.stack);
        assert_eq!(thread.state(), JobState::Suspended);
    }

    #[tokio::test]
    async fn test_resume_matches_uninterrupted_run() {
        let harness = Harness::new();
        let call = Call::new("twice").arg("x", &4).unwrap();

        let mut straight = harness.claim(call.clone()).await;
        let expected = straight.run_to_end().await.unwrap();

        let job_id = harness.backend.submit(call, Extra::new()).await.unwrap();
        let mut first = harness.claim_id(&job_id).await;
        first.step().await.unwrap();
        first.step().await.unwrap();
        first.release().await.unwrap();

        let mut second = harness.claim_id(&job_id).await;
        assert_eq!(second.stack_depth(), 1);
        let end = second.run_to_end().await.unwrap();
        assert_eq!(end.return_value, expected.return_value);
    }

    #[tokio::test]
    async fn test_cancel_observed_at_checkpoint() {
        let harness = Harness::new();
        let mut thread = harness.claim(Call::new("sum").arg("n", &100).unwrap()).await;
        thread.step().await.unwrap();

        harness.backend.cancel(thread.job_id()).await.unwrap();
        assert_eq!(thread.step().await.unwrap(), JobState::Failed);
        assert!(thread.end().unwrap().exception.as_ref().unwrap().is_cancellation());

        let (record, _) = harness.record(thread.job_id()).await;
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_method_fails_job() {
        let harness = Harness::new();
        let mut thread = harness.claim(Call::new("nobody_home")).await;
        assert_eq!(thread.step().await.unwrap(), JobState::Failed);
        assert_eq!(
            thread.end().unwrap().exception.as_ref().unwrap().kind,
            JobException::UNKNOWN_METHOD
        );
    }

    struct FailingBackend;

    #[async_trait]
    impl JobsProcess for FailingBackend {
        async fn claim(&self, _: &JobId, _: &crate::types::SessionId) -> Result<Option<ClaimedJob>> {
            Ok(None)
        }
        async fn claim_next(&self, _: &crate::types::SessionId) -> Result<Option<ClaimedJob>> {
            Ok(None)
        }
        async fn save_job_state(&self, _: &mut JobLease, _: &State, _: &Bytes) -> Result<Checkpoint> {
            Err(Error::connection_lost("store unreachable"))
        }
        async fn done_job(&self, _: &mut JobLease, _: JobEnd) -> Result<()> {
            Err(Error::connection_lost("store unreachable"))
        }
        async fn release(&self, _: JobLease) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_checkpoint_failure_abandons() {
        let harness = Harness::new();
        let job_id = harness
            .backend
            .submit(Call::new("sum").arg("n", &3).unwrap(), Extra::new())
            .await
            .unwrap();
        let session = harness.backend.store().open_session(Duration::from_secs(30)).await.unwrap();
        let claimed = harness.backend.claim(&job_id, &session).await.unwrap().unwrap();

        let mut thread =
            JobThread::from_claim(claimed, methods(), Arc::new(FailingBackend), harness.backend.cas_storage()).unwrap();
        let err = thread.step().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
        assert_eq!(thread.state(), JobState::Abandoned);
        assert!(thread.end().is_none());
    }
}
