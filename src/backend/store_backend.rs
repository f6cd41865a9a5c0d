//! [`Backend`]: the job contract implemented over a [`CasStore`].
//!
//! Ownership of a running job is two-fold: an ephemeral lease key at
//! `/leases/<job_id>` bound to the worker's session, and the `owner` field of
//! the record. Every record write is a CAS on the record version, so a worker
//! that lost its lease (and was reaped) fails its next checkpoint instead of
//! overwriting the new owner's progress.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::record::{decode_record, job_key, lease_key, JOBS_PREFIX, WORKERS_PREFIX};
use super::{
    CancelOutcome, CasStorage, Checkpoint, ClaimedJob, JobEnd, JobFilter, JobLease, JobRecord,
    JobStatus, JobSummary, JobsControl, JobsGc, JobsProcess, NamespacedStorage,
};
use crate::codec::{Call, Extra, State};
use crate::store::{CasStore, Entry, Watch, WatchEvent};
use crate::types::{Error, JobId, Result, SessionId, WorkerId};

/// Bound on re-reads when a CAS loses only to a concurrent cancel request.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Job backend over a coordination store.
pub struct Backend<S: CasStore> {
    store: Arc<S>,
}

impl<S: CasStore> Clone for Backend<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: CasStore> std::fmt::Debug for Backend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

impl<S: CasStore> Backend<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Handler-facing storage confined to the `/user/` namespace.
    pub fn cas_storage(&self) -> Arc<dyn CasStorage> {
        Arc::new(NamespacedStorage::new(Arc::clone(&self.store)))
    }

    /// Watch job record changes.
    pub async fn watch_jobs(&self) -> Result<Watch> {
        self.store.watch(JOBS_PREFIX).await
    }

    /// Whether a job watch event may have left a job claimable. Updates
    /// count only when the record is pending afterwards.
    pub async fn may_unblock_claim(&self, event: &WatchEvent) -> bool {
        match event {
            WatchEvent::Created { .. } | WatchEvent::Resync => true,
            WatchEvent::Deleted { .. } => false,
            WatchEvent::Updated { key, .. } => match self.read_entry(key).await {
                Ok(Some(entry)) => decode_record(key, &entry.value)
                    .is_ok_and(|record| record.status == JobStatus::Pending),
                Ok(None) => false,
                Err(_) => true,
            },
        }
    }

    /// Publish a worker under `/workers/<id>`; it vanishes with the session.
    pub async fn announce_worker(&self, worker_id: &WorkerId, session: &SessionId) -> Result<u64> {
        let body = json!({
            "worker_id": worker_id,
            "session": session,
            "started_at": Utc::now(),
        });
        let key = format!("{}{}", WORKERS_PREFIX, worker_id);
        self.store
            .create_ephemeral(&key, Bytes::from(serde_json::to_vec(&body)?), session)
            .await
    }

    /// Ids of workers whose session is alive.
    pub async fn live_workers(&self) -> Result<Vec<String>> {
        let keys = self.store.list(WORKERS_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(WORKERS_PREFIX).map(str::to_string))
            .collect())
    }

    /// Block until the job ends and return its outcome.
    pub async fn wait_result(&self, job_id: &JobId) -> Result<JobEnd> {
        let mut watch = self.store.watch(&job_key(job_id)).await?;
        loop {
            if let Some(end) = self.result(job_id).await? {
                return Ok(end);
            }
            if watch.next().await.is_none() {
                return Err(Error::connection_lost(format!(
                    "watch closed while waiting for job {}",
                    job_id
                )));
            }
        }
    }

    async fn read(&self, job_id: &JobId) -> Result<(JobRecord, u64)> {
        let key = job_key(job_id);
        let entry = self.store.get(&key).await?;
        Ok((decode_record(&key, &entry.value)?, entry.version))
    }

    async fn read_entry(&self, key: &str) -> Result<Option<Entry>> {
        match self.store.get(key).await {
            Ok(entry) => Ok(Some(entry)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn insert(&self, record: JobRecord) -> Result<JobId> {
        let job_id = record.job_id.clone();
        let version = self.store.create(&job_key(&job_id), record.encode()?).await?;
        tracing::info!(job_id = %job_id, method = %record.method, version, "job_submitted");
        Ok(job_id)
    }

    /// CAS a write through a lease, re-deriving from a fresh read when the
    /// only concurrent change is a cancel request.
    async fn write_owned<F>(&self, lease: &mut JobLease, mutate: F) -> Result<()>
    where
        F: Fn(&mut JobRecord) + Send + Sync,
    {
        let key = job_key(&lease.job_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut record = lease.record.clone();
            mutate(&mut record);
            record.touch();
            match self.store.set(&key, record.encode()?, Some(lease.version)).await {
                Ok(version) => {
                    lease.version = version;
                    lease.record = record;
                    return Ok(());
                }
                Err(Error::VersionConflict(_)) => {
                    let (fresh, version) = self.read(&lease.job_id).await?;
                    if fresh.status != JobStatus::Running || fresh.owner.as_ref() != Some(&lease.session) {
                        return Err(Error::version_conflict(format!(
                            "job {} is no longer owned by session {}",
                            lease.job_id, lease.session
                        )));
                    }
                    tracing::debug!(job_id = %lease.job_id, version, "owned_write_rederived");
                    lease.record.cancel_requested = fresh.cancel_requested;
                    lease.version = version;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::version_conflict(format!(
            "job {}: too many concurrent updates",
            lease.job_id
        )))
    }

    async fn drop_lease(&self, job_id: &JobId) {
        match self.store.delete(&lease_key(job_id), None).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "lease_delete_failed"),
        }
    }
}

#[async_trait]
impl<S: CasStore> JobsControl for Backend<S> {
    async fn submit(&self, call: Call, extra: Extra) -> Result<JobId> {
        self.submit_as(JobId::new(), call, extra).await
    }

    async fn submit_as(&self, job_id: JobId, call: Call, extra: Extra) -> Result<JobId> {
        let state = call.dump()?;
        let record = JobRecord::new(job_id, call.method, state.into_bytes(), extra);
        self.insert(record).await
    }

    async fn cancel(&self, job_id: &JobId) -> Result<CancelOutcome> {
        let key = job_key(job_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut record, version) = self.read(job_id).await?;
            let outcome = match record.status {
                JobStatus::Done | JobStatus::Failed => return Ok(CancelOutcome::AlreadyEnded),
                JobStatus::Running if record.cancel_requested => return Ok(CancelOutcome::Requested),
                JobStatus::Running => {
                    record.cancel_requested = true;
                    record.touch();
                    CancelOutcome::Requested
                }
                JobStatus::Pending => {
                    record.cancel_requested = true;
                    record.finish(JobEnd::cancelled(job_id.clone()));
                    CancelOutcome::Cancelled
                }
            };
            match self.store.set(&key, record.encode()?, Some(version)).await {
                Ok(version) => {
                    tracing::info!(job_id = %job_id, outcome = ?outcome, version, "job_cancel");
                    return Ok(outcome);
                }
                Err(Error::VersionConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::version_conflict(format!("job {}: too many concurrent updates", job_id)))
    }

    async fn get(&self, job_id: &JobId) -> Result<(JobRecord, u64)> {
        self.read(job_id).await
    }

    async fn result(&self, job_id: &JobId) -> Result<Option<JobEnd>> {
        let (record, _) = self.read(job_id).await?;
        if !record.status.is_terminal() {
            return Ok(None);
        }
        record
            .end
            .map(Some)
            .ok_or_else(|| Error::internal(format!("job {} ended without an outcome", job_id)))
    }

    fn list(&self, filter: JobFilter) -> BoxStream<'_, Result<JobSummary>> {
        let store = Arc::clone(&self.store);
        stream::unfold(None::<std::vec::IntoIter<String>>, move |keys| {
            let store = Arc::clone(&store);
            let filter = filter.clone();
            async move {
                let mut keys = match keys {
                    Some(keys) => keys,
                    None => match store.list(JOBS_PREFIX).await {
                        Ok(keys) => keys.into_iter(),
                        Err(e) => return Some((Err(e), Some(Vec::new().into_iter()))),
                    },
                };
                while let Some(key) = keys.next() {
                    let entry = match store.get(&key).await {
                        Ok(entry) => entry,
                        Err(Error::NotFound(_)) => continue,
                        Err(e) => return Some((Err(e), Some(keys))),
                    };
                    match decode_record(&key, &entry.value) {
                        Ok(record) if filter.matches(&record) => {
                            return Some((Ok(record.summary(entry.version)), Some(keys)));
                        }
                        Ok(_) => {}
                        Err(e) => return Some((Err(e), Some(keys))),
                    }
                }
                None
            }
        })
        .boxed()
    }
}

#[async_trait]
impl<S: CasStore> JobsProcess for Backend<S> {
    async fn claim(&self, job_id: &JobId, session: &SessionId) -> Result<Option<ClaimedJob>> {
        let (record, version) = match self.read(job_id).await {
            Ok(found) => found,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if record.status != JobStatus::Pending {
            return Ok(None);
        }

        let lease = lease_key(job_id);
        match self
            .store
            .create_ephemeral(&lease, Bytes::from(session.as_str().to_string()), session)
            .await
        {
            Ok(_) => {}
            Err(Error::EntryExists(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        let mut claimed = record;
        claimed.status = JobStatus::Running;
        claimed.owner = Some(session.clone());
        claimed.attempts += 1;
        claimed.touch();

        let version = match self.store.set(&job_key(job_id), claimed.encode()?, Some(version)).await {
            Ok(version) => version,
            Err(e) => {
                self.drop_lease(job_id).await;
                return match e {
                    Error::VersionConflict(_) | Error::NotFound(_) => Ok(None),
                    other => Err(other),
                };
            }
        };

        tracing::info!(
            job_id = %job_id,
            session = %session,
            attempt = claimed.attempts,
            version,
            "job_claimed"
        );

        Ok(Some(ClaimedJob {
            state: State::from_bytes(claimed.state.clone()),
            stack: claimed.stack.clone(),
            extra: claimed.extra.clone(),
            resumed: claimed.checkpoints > 0,
            lease: JobLease {
                job_id: job_id.clone(),
                session: session.clone(),
                version,
                record: claimed,
            },
        }))
    }

    async fn claim_next(&self, session: &SessionId) -> Result<Option<ClaimedJob>> {
        let mut pending = Vec::new();
        for key in self.store.list(JOBS_PREFIX).await? {
            let Some(entry) = self.read_entry(&key).await? else {
                continue;
            };
            match decode_record(&key, &entry.value) {
                Ok(record) if record.status == JobStatus::Pending => {
                    pending.push((record.created_at, record.job_id));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping_corrupt_record"),
            }
        }
        pending.sort();

        for (_, job_id) in pending {
            if let Some(claimed) = self.claim(&job_id, session).await? {
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    async fn save_job_state(&self, lease: &mut JobLease, state: &State, stack: &Bytes) -> Result<Checkpoint> {
        let state = state.clone().into_bytes();
        self.write_owned(lease, |record| {
            record.state = state.clone();
            record.stack = stack.clone();
            record.checkpoints += 1;
        })
        .await?;

        tracing::debug!(
            job_id = %lease.job_id,
            version = lease.version,
            checkpoints = lease.record.checkpoints,
            "job_checkpointed"
        );
        Ok(Checkpoint {
            version: lease.version,
            cancel_requested: lease.record.cancel_requested,
        })
    }

    async fn done_job(&self, lease: &mut JobLease, end: JobEnd) -> Result<()> {
        if end.job_id != lease.job_id {
            return Err(Error::validation(format!(
                "outcome for job {} reported through lease on {}",
                end.job_id, lease.job_id
            )));
        }
        let status = end.status();
        self.write_owned(lease, |record| record.finish(end.clone())).await?;
        self.drop_lease(&lease.job_id).await;

        tracing::info!(job_id = %lease.job_id, status = ?status, version = lease.version, "job_done");
        Ok(())
    }

    async fn release(&self, mut lease: JobLease) -> Result<()> {
        let job_id = lease.job_id.clone();
        self.write_owned(&mut lease, |record| {
            if record.cancel_requested {
                record.finish(JobEnd::cancelled(record.job_id.clone()));
            } else {
                record.status = JobStatus::Pending;
                record.owner = None;
            }
        })
        .await?;
        self.drop_lease(&job_id).await;

        tracing::info!(job_id = %job_id, status = ?lease.record.status, "job_released");
        Ok(())
    }
}

#[async_trait]
impl<S: CasStore> JobsGc for Backend<S> {
    async fn reap(&self) -> Result<usize> {
        let mut reaped = 0;
        for key in self.store.list(JOBS_PREFIX).await? {
            let Some(entry) = self.read_entry(&key).await? else {
                continue;
            };
            let mut record = match decode_record(&key, &entry.value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping_corrupt_record");
                    continue;
                }
            };
            if record.status != JobStatus::Running {
                continue;
            }

            let lease_alive = match self.read_entry(&lease_key(&record.job_id)).await? {
                Some(lease) => lease.ephemeral_owner.is_some() && lease.ephemeral_owner == record.owner,
                None => false,
            };
            if lease_alive {
                continue;
            }

            let previous_owner = record.owner.take();
            if record.cancel_requested {
                record.finish(JobEnd::cancelled(record.job_id.clone()));
            } else {
                record.status = JobStatus::Pending;
                record.touch();
            }

            match self.store.set(&key, record.encode()?, Some(entry.version)).await {
                Ok(version) => {
                    reaped += 1;
                    tracing::info!(
                        job_id = %record.job_id,
                        previous_owner = ?previous_owner,
                        status = ?record.status,
                        version,
                        "job_reaped"
                    );
                }
                Err(Error::VersionConflict(_)) | Err(Error::NotFound(_)) => {
                    tracing::debug!(job_id = %record.job_id, "reap_lost_race");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    async fn collect_ended(&self, retention: Duration) -> Result<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| Error::validation(format!("retention out of range: {}", e)))?;
        let cutoff = Utc::now() - retention;

        let mut removed = 0;
        for key in self.store.list(JOBS_PREFIX).await? {
            let Some(entry) = self.read_entry(&key).await? else {
                continue;
            };
            let Ok(record) = decode_record(&key, &entry.value) else {
                continue;
            };
            if !record.status.is_terminal() || record.updated_at > cutoff {
                continue;
            }
            match self.store.delete(&key, Some(entry.version)).await {
                Ok(()) => removed += 1,
                Err(Error::VersionConflict(_)) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "ended_jobs_collected");
        }
        Ok(removed)
    }
}
