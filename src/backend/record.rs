//! Persisted job records.
//!
//! One JSON document per job at `/jobs/<job_id>`. The CAS entry version is the
//! job version; every checkpoint, claim, reap and cancel is a conditional
//! write against it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{Extra, JobException};
use crate::types::{Error, JobId, Result, SessionId};

/// Namespace of job records.
pub const JOBS_PREFIX: &str = "/jobs/";
/// Namespace of per-job ownership leases (ephemeral keys).
pub const LEASES_PREFIX: &str = "/leases/";
/// Namespace of live worker announcements (ephemeral keys).
pub const WORKERS_PREFIX: &str = "/workers/";
/// Namespace exposed to handlers through `CasStorage`.
pub const USER_PREFIX: &str = "/user/";

pub fn job_key(job_id: &JobId) -> String {
    format!("{}{}", JOBS_PREFIX, job_id)
}

pub fn lease_key(job_id: &JobId) -> String {
    format!("{}{}", LEASES_PREFIX, job_id)
}

/// Persisted lifecycle of a job.
///
/// `Running` covers both the in-memory RUNNING and SUSPENDED states: between
/// checkpoints the record does not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// Terminal outcome of a job. Exactly one of `return_value`/`exception` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnd {
    pub job_id: JobId,
    pub return_value: Option<Value>,
    pub exception: Option<JobException>,
}

impl JobEnd {
    pub fn returned(job_id: JobId, value: Value) -> Self {
        Self {
            job_id,
            return_value: Some(value),
            exception: None,
        }
    }

    pub fn raised(job_id: JobId, exception: JobException) -> Self {
        Self {
            job_id,
            return_value: None,
            exception: Some(exception),
        }
    }

    pub fn cancelled(job_id: JobId) -> Self {
        Self::raised(job_id, JobException::cancelled())
    }

    pub fn is_success(&self) -> bool {
        self.exception.is_none()
    }

    pub fn status(&self) -> JobStatus {
        if self.is_success() {
            JobStatus::Done
        } else {
            JobStatus::Failed
        }
    }
}

/// The persisted job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    /// Method of the initial call, kept for listing.
    pub method: String,
    #[serde(with = "base64_bytes")]
    pub state: Bytes,
    #[serde(with = "base64_bytes")]
    pub stack: Bytes,
    #[serde(default)]
    pub extra: Extra,
    pub status: JobStatus,
    /// Session holding the lease while `Running`.
    pub owner: Option<SessionId>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Number of times the job has been claimed.
    #[serde(default)]
    pub attempts: u32,
    /// Number of checkpoints written.
    #[serde(default)]
    pub checkpoints: u64,
    pub end: Option<JobEnd>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job_id: JobId, method: String, state: Bytes, extra: Extra) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            method,
            state,
            stack: Bytes::new(),
            extra,
            status: JobStatus::Pending,
            owner: None,
            cancel_requested: false,
            attempts: 0,
            checkpoints: 0,
            end: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn finish(&mut self, end: JobEnd) {
        self.status = end.status();
        self.owner = None;
        self.end = Some(end);
        self.touch();
    }

    pub fn summary(&self, version: u64) -> JobSummary {
        JobSummary {
            job_id: self.job_id.clone(),
            method: self.method.clone(),
            status: self.status,
            owner: self.owner.clone(),
            cancel_requested: self.cancel_requested,
            attempts: self.attempts,
            version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Listing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub method: String,
    pub status: JobStatus,
    pub owner: Option<SessionId>,
    pub cancel_requested: bool,
    pub attempts: u32,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filter for `JobsControl::list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub method: Option<String>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            method: None,
        }
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.map_or(true, |s| s == record.status)
            && self.method.as_deref().map_or(true, |m| m == record.method)
    }
}

/// Decode a stored entry, mapping corrupt documents to an internal error.
pub(crate) fn decode_record(key: &str, bytes: &[u8]) -> Result<JobRecord> {
    JobRecord::decode(bytes).map_err(|e| Error::internal(format!("corrupt job record {}: {}", key, e)))
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
