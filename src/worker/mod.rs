//! Worker pool.
//!
//! Each worker is a tokio task with its own coordination session, so a hung
//! or crashed worker only loses its own leases. A worker runs one job at a
//! time: claim, step to the end, claim again. Idle workers wake when a job
//! record is created or returns to pending, and fall back to polling.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, ClaimedJob, JobEnd, JobsProcess};
use crate::codec::{JobException, MethodTable};
use crate::engine::JobThread;
use crate::store::{CasStore, Watch, WatchEvent};
use crate::types::{Error, Result, SessionId, WorkerConfig, WorkerId};

/// A fixed-size pool of workers sharing one method table.
pub struct WorkerPool<S: CasStore> {
    backend: Backend<S>,
    methods: Arc<MethodTable>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    workers: Vec<(WorkerId, JoinHandle<()>)>,
}

impl<S: CasStore> WorkerPool<S> {
    pub fn new(backend: Backend<S>, methods: MethodTable, config: WorkerConfig) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(Error::validation("worker pool_size must be at least 1"));
        }
        if config.keepalive_interval >= config.session_ttl {
            return Err(Error::validation(format!(
                "keepalive_interval ({:?}) must be shorter than session_ttl ({:?})",
                config.keepalive_interval, config.session_ttl
            )));
        }
        Ok(Self {
            backend,
            methods: Arc::new(methods),
            config,
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
        })
    }

    /// Spawn the workers. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if !self.workers.is_empty() {
            return;
        }
        for _ in 0..self.config.pool_size {
            let worker = Worker {
                id: WorkerId::new(),
                backend: self.backend.clone(),
                methods: Arc::clone(&self.methods),
                config: self.config.clone(),
                shutdown: self.shutdown.clone(),
            };
            let id = worker.id.clone();
            self.workers.push((id, tokio::spawn(worker.run())));
        }
        tracing::info!(pool_size = self.config.pool_size, "worker_pool_started");
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Token cancelled on shutdown; hand it to signal handlers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop all workers. Jobs in flight are released at their next step.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for (id, handle) in self.workers {
            if let Err(e) = handle.await {
                tracing::error!(worker = %id, error = %e, "worker_task_failed");
            }
        }
        tracing::info!("worker_pool_stopped");
    }
}

impl<S: CasStore> std::fmt::Debug for WorkerPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pool_size", &self.config.pool_size)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

struct Worker<S: CasStore> {
    id: WorkerId,
    backend: Backend<S>,
    methods: Arc<MethodTable>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl<S: CasStore> Worker<S> {
    async fn run(self) {
        tracing::info!(worker = %self.id, "worker_started");
        while !self.shutdown.is_cancelled() {
            let session = match self.backend.store().open_session(self.config.session_ttl).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(worker = %self.id, error = %e, "worker_session_open_failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(self.config.poll_interval) => continue,
                    }
                }
            };
            if let Err(e) = self.backend.announce_worker(&self.id, &session).await {
                tracing::warn!(worker = %self.id, error = %e, "worker_announce_failed");
            }

            let session_token = self.shutdown.child_token();
            let keepalive = self.spawn_keepalive(session.clone(), session_token.clone());
            self.serve(&session, &session_token).await;

            session_token.cancel();
            if let Err(e) = keepalive.await {
                tracing::error!(worker = %self.id, error = %e, "keepalive_task_failed");
            }
            match self.backend.store().close_session(&session).await {
                Ok(()) | Err(Error::SessionExpired(_)) => {}
                Err(e) => tracing::warn!(worker = %self.id, error = %e, "worker_session_close_failed"),
            }
        }
        tracing::info!(worker = %self.id, "worker_stopped");
    }

    /// Claim and run jobs until shutdown or until the session is lost.
    async fn serve(&self, session: &SessionId, session_token: &CancellationToken) {
        let mut watch = match self.backend.watch_jobs().await {
            Ok(watch) => Some(watch),
            Err(e) => {
                tracing::warn!(worker = %self.id, error = %e, "worker_watch_unavailable");
                None
            }
        };

        while !session_token.is_cancelled() {
            match self.backend.claim_next(session).await {
                Ok(Some(claimed)) => {
                    self.execute(claimed, session_token).await;
                    continue;
                }
                Ok(None) => {}
                Err(Error::SessionExpired(_)) => {
                    tracing::warn!(worker = %self.id, session = %session, "worker_session_expired");
                    return;
                }
                Err(e) => tracing::warn!(worker = %self.id, error = %e, "claim_failed"),
            }

            if !self.wait_for_work(&mut watch, session_token).await {
                return;
            }
        }
    }

    /// Sleep until the poll interval elapses or a job event may have made
    /// a job claimable. Returns false once the session token is cancelled.
    async fn wait_for_work(&self, watch: &mut Option<Watch>, session_token: &CancellationToken) -> bool {
        let poll = sleep(self.config.poll_interval);
        tokio::pin!(poll);
        loop {
            tokio::select! {
                _ = session_token.cancelled() => return false,
                _ = &mut poll => return true,
                event = next_job_event(watch) => match event {
                    Some(event) => {
                        if self.backend.may_unblock_claim(&event).await {
                            return true;
                        }
                    }
                    None => {
                        tracing::debug!(worker = %self.id, "worker_watch_closed");
                        *watch = None;
                    }
                },
            }
        }
    }

    async fn execute(&self, claimed: ClaimedJob, session_token: &CancellationToken) {
        let mut lease = claimed.lease.clone();
        let backend: Arc<dyn JobsProcess> = Arc::new(self.backend.clone());
        let mut thread = match JobThread::from_claim(
            claimed,
            Arc::clone(&self.methods),
            Arc::clone(&backend),
            self.backend.cas_storage(),
        ) {
            Ok(thread) => thread,
            Err(Error::Encoding(message)) => {
                // A stack that cannot be decoded will never run anywhere.
                let end = JobEnd::raised(lease.job_id.clone(), JobException::new("encoding", message));
                if let Err(e) = backend.done_job(&mut lease, end).await {
                    tracing::warn!(worker = %self.id, job_id = %lease.job_id, error = %e, "job_fail_failed");
                }
                return;
            }
            Err(e) => {
                tracing::error!(worker = %self.id, job_id = %lease.job_id, error = %e, "job_setup_failed");
                return;
            }
        };

        while !thread.state().is_terminal() {
            if session_token.is_cancelled() {
                let job_id = thread.job_id().clone();
                if let Err(e) = thread.release().await {
                    tracing::warn!(worker = %self.id, job_id = %job_id, error = %e, "job_release_failed");
                }
                return;
            }
            if let Err(e) = thread.step().await {
                tracing::warn!(worker = %self.id, job_id = %thread.job_id(), error = %e, "job_attempt_aborted");
                if matches!(e, Error::ConnectionLost(_)) {
                    let job_id = thread.job_id().clone();
                    if let Err(e) = thread.release().await {
                        tracing::debug!(worker = %self.id, job_id = %job_id, error = %e, "job_release_failed");
                    }
                }
                return;
            }
        }
    }

    fn spawn_keepalive(&self, session: SessionId, token: CancellationToken) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let period = self.config.keepalive_interval;
        let worker = self.id.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match backend.store().keep_alive(&session).await {
                        Ok(()) => tracing::trace!(worker = %worker, session = %session, "session_refreshed"),
                        Err(Error::SessionExpired(_)) => {
                            tracing::warn!(worker = %worker, session = %session, "session_lost");
                            token.cancel();
                            break;
                        }
                        Err(e) => tracing::warn!(worker = %worker, error = %e, "keepalive_failed"),
                    },
                }
            }
        })
    }
}

async fn next_job_event(watch: &mut Option<Watch>) -> Option<WatchEvent> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{JobStatus, JobsControl};
    use crate::codec::{Call, Extra, Step};
    use crate::store::MemoryStore;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn config(pool_size: usize) -> WorkerConfig {
        WorkerConfig {
            pool_size,
            poll_interval: Duration::from_millis(50),
            session_ttl: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(2),
        }
    }

    fn methods() -> MethodTable {
        MethodTable::new().with("echo", |kwargs, _ctx| async move {
            Ok(Step::Return(kwargs.get("v").cloned().unwrap_or(Value::Null)))
        })
    }

    #[test]
    fn test_rejects_bad_config() {
        let backend = Backend::new(Arc::new(MemoryStore::new()));
        assert!(WorkerPool::new(backend.clone(), methods(), config(0)).is_err());

        let mut slow = config(1);
        slow.keepalive_interval = slow.session_ttl;
        assert!(matches!(
            WorkerPool::new(backend, methods(), slow),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_pool_runs_submitted_jobs() {
        let backend = Backend::new(Arc::new(MemoryStore::new()));
        let mut pool = WorkerPool::new(backend.clone(), methods(), config(3)).unwrap();
        pool.start();
        assert_eq!(pool.worker_ids().len(), 3);

        let mut jobs = Vec::new();
        for i in 0..10 {
            let call = Call::new("echo").arg("v", &i).unwrap();
            jobs.push(backend.submit(call, Extra::new()).await.unwrap());
        }
        for (i, job_id) in jobs.iter().enumerate() {
            let end = tokio::time::timeout(Duration::from_secs(5), backend.wait_result(job_id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(end.return_value, Some(json!(i)));
        }

        pool.shutdown().await;
        assert!(backend.live_workers().await.unwrap().is_empty());
        let (record, _) = backend.get(&jobs[0]).await.unwrap();
        assert_eq!(record.status, JobStatus::Done);
    }
}
