//! Background garbage collection for job records.
//!
//! GcService periodically:
//! - reaps running jobs whose owner's lease vanished (session expiry)
//! - removes finished records past the retention window
//!
//! Lease deletions observed through a watch trigger an early reap, so a
//! crashed worker's job is usually reclaimable right after its session
//! expires instead of at the next tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};

use super::record::LEASES_PREFIX;
use super::{Backend, JobsGc};
use crate::store::{CasStore, Watch, WatchEvent};
use crate::types::{GcConfig, Result};

/// Statistics from a GC cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcStats {
    /// Running jobs reset to pending (or ended, if cancelled)
    pub reaped: usize,
    /// Finished records removed
    pub collected: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Periodic reaper. Safe to run from several processes at once: every reset
/// is a CAS on the job version.
#[derive(Debug)]
pub struct GcService<S: CasStore> {
    backend: Backend<S>,
    config: GcConfig,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl<S: CasStore> GcService<S> {
    pub fn new(backend: Backend<S>, config: GcConfig) -> Self {
        Self {
            backend,
            config,
            stop_tx: None,
        }
    }

    /// Start the GC loop in the background.
    /// Returns immediately; cycles run in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let backend = self.backend.clone();
        let config = self.config.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut leases = match backend.store().watch(LEASES_PREFIX).await {
                Ok(watch) => Some(watch),
                Err(e) => {
                    tracing::warn!(error = %e, "gc_lease_watch_unavailable");
                    None
                }
            };

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::run_cycle_with(&backend, &config).await {
                            tracing::error!(error = %e, "gc_cycle_failed");
                        }
                    }
                    event = next_lease_event(&mut leases) => match event {
                        Some(WatchEvent::Deleted { .. }) | Some(WatchEvent::Resync) => {
                            if let Err(e) = backend.reap().await {
                                tracing::error!(error = %e, "gc_reap_failed");
                            }
                        }
                        Some(_) => {}
                        None => {
                            tracing::warn!("gc_lease_watch_closed");
                            leases = None;
                        }
                    },
                    _ = &mut stop_rx => {
                        tracing::info!("gc_service_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the GC loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single GC cycle now.
    pub async fn run_cycle(&self) -> Result<GcStats> {
        Self::run_cycle_with(&self.backend, &self.config).await
    }

    async fn run_cycle_with(backend: &Backend<S>, config: &GcConfig) -> Result<GcStats> {
        let mut stats = GcStats {
            reaped: backend.reap().await?,
            collected: backend.collect_ended(config.ended_retention).await?,
            completed_at: None,
        };

        tracing::debug!(reaped = stats.reaped, collected = stats.collected, "gc_cycle_completed");
        stats.completed_at = Some(Utc::now());
        Ok(stats)
    }
}

async fn next_lease_event(watch: &mut Option<Watch>) -> Option<WatchEvent> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{JobStatus, JobsControl, JobsProcess};
    use crate::codec::{Call, Extra};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> GcConfig {
        GcConfig {
            interval: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cycle_stats() {
        let backend = Backend::new(Arc::new(MemoryStore::new()));
        let job_id = backend.submit(Call::new("f"), Extra::new()).await.unwrap();
        let session = backend.store().open_session(Duration::from_secs(30)).await.unwrap();
        backend.claim(&job_id, &session).await.unwrap().unwrap();
        backend.store().close_session(&session).await.unwrap();

        let gc = GcService::new(
            backend.clone(),
            GcConfig {
                ended_retention: Duration::ZERO,
                ..config()
            },
        );
        let stats = gc.run_cycle().await.unwrap();
        assert_eq!(stats.reaped, 1);
        assert_eq!(stats.collected, 0);
        assert!(stats.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_reaps_after_session_expiry() {
        let backend = Backend::new(Arc::new(MemoryStore::new()));
        let job_id = backend.submit(Call::new("f"), Extra::new()).await.unwrap();
        let session = backend.store().open_session(Duration::from_secs(5)).await.unwrap();
        backend.claim(&job_id, &session).await.unwrap().unwrap();

        let mut gc = GcService::new(backend.clone(), config());
        let handle = gc.start();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(backend.get(&job_id).await.unwrap().0.status, JobStatus::Running);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(backend.get(&job_id).await.unwrap().0.status, JobStatus::Pending);

        gc.stop();
        handle.await.unwrap();
    }
}
