//! Backend contract: the single seam between workers and shared state.
//!
//! - [`JobsControl`]: submit, cancel, inspect and list jobs
//! - [`JobsProcess`]: claim jobs, persist checkpoints, finalize jobs
//! - [`JobsGc`]: reclaim jobs whose owner's lease vanished
//! - [`CasStorage`]: namespaced CAS access for handler bookkeeping
//!
//! [`Backend`] implements all four on top of any [`crate::store::CasStore`].

mod coordinator;
mod gc;
mod record;
mod storage;
mod store_backend;

pub use coordinator::{Coordinator, EventOutcome};
pub use gc::{GcService, GcStats};
pub use record::{
    job_key, lease_key, JobEnd, JobFilter, JobRecord, JobStatus, JobSummary, JOBS_PREFIX,
    LEASES_PREFIX, USER_PREFIX, WORKERS_PREFIX,
};
pub use storage::NamespacedStorage;
pub use store_backend::Backend;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;
use std::time::Duration;

use crate::codec::{Call, Extra, State};
use crate::store::Entry;
use crate::types::{JobId, Result, SessionId};

/// Worker-private handle on a claimed job.
///
/// Carries the record version the worker last wrote; every write made through
/// it is a CAS against that version.
#[derive(Debug, Clone)]
pub struct JobLease {
    pub job_id: JobId,
    pub session: SessionId,
    pub version: u64,
    pub(crate) record: JobRecord,
}

impl JobLease {
    pub fn cancel_requested(&self) -> bool {
        self.record.cancel_requested
    }
}

/// A job handed to a worker by `claim`.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub lease: JobLease,
    /// Current continuation: the initial call or the last checkpoint.
    pub state: State,
    pub stack: Bytes,
    pub extra: Extra,
    /// True when the job had checkpointed before (resumed after a crash).
    pub resumed: bool,
}

/// Reply to a checkpoint write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub version: u64,
    pub cancel_requested: bool,
}

/// Outcome of `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started; it is now failed with a cancellation.
    Cancelled,
    /// The flag is set; the owner observes it at its next checkpoint.
    Requested,
    /// The job had already ended.
    AlreadyEnded,
}

#[async_trait]
pub trait JobsControl: Send + Sync {
    /// Submit a new job. Fails with `Error::Encoding` if the call cannot be encoded.
    async fn submit(&self, call: Call, extra: Extra) -> Result<JobId>;

    /// Submit under a caller-chosen id; `Error::EntryExists` if already taken.
    async fn submit_as(&self, job_id: JobId, call: Call, extra: Extra) -> Result<JobId>;

    /// Request cancellation.
    async fn cancel(&self, job_id: &JobId) -> Result<CancelOutcome>;

    /// Fetch a job record with its version.
    async fn get(&self, job_id: &JobId) -> Result<(JobRecord, u64)>;

    /// Terminal outcome, or `None` while the job is still live.
    async fn result(&self, job_id: &JobId) -> Result<Option<JobEnd>>;

    /// Lazily list jobs matching `filter`.
    fn list(&self, filter: JobFilter) -> BoxStream<'_, Result<JobSummary>>;
}

#[async_trait]
pub trait JobsProcess: Send + Sync {
    /// Try to take ownership of a pending job. `None` if someone else has it
    /// or it is not pending.
    async fn claim(&self, job_id: &JobId, session: &SessionId) -> Result<Option<ClaimedJob>>;

    /// Claim the oldest claimable job, if any.
    async fn claim_next(&self, session: &SessionId) -> Result<Option<ClaimedJob>>;

    /// Persist a checkpoint. `Error::VersionConflict` if the job is no longer
    /// owned through `lease`.
    async fn save_job_state(&self, lease: &mut JobLease, state: &State, stack: &Bytes) -> Result<Checkpoint>;

    /// Record the terminal outcome and drop the lease.
    async fn done_job(&self, lease: &mut JobLease, end: JobEnd) -> Result<()>;

    /// Hand a job back without finishing it (worker shutdown or aborted attempt).
    async fn release(&self, lease: JobLease) -> Result<()>;
}

#[async_trait]
pub trait JobsGc: Send + Sync {
    /// Reset running jobs whose lease vanished. Returns how many were reset.
    async fn reap(&self) -> Result<usize>;

    /// Remove finished jobs last updated more than `retention` ago.
    async fn collect_ended(&self, retention: Duration) -> Result<usize>;
}

/// CAS access exposed to handler authors.
#[async_trait]
pub trait CasStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Entry>;
    async fn set(&self, key: &str, value: Bytes, expected_version: Option<u64>) -> Result<u64>;
    async fn create(&self, key: &str, value: Bytes) -> Result<u64>;
    async fn delete(&self, key: &str, expected_version: Option<u64>) -> Result<()>;

    /// Read a JSON document, `None` when absent.
    async fn get_json(&self, key: &str) -> Result<Option<(Value, u64)>> {
        match self.get(key).await {
            Ok(entry) => Ok(Some((serde_json::from_slice(&entry.value)?, entry.version))),
            Err(crate::types::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
