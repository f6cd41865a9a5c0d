//! Watch notifications.

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// A change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchEvent {
    Created { key: String, version: u64 },
    Updated { key: String, version: u64 },
    Deleted { key: String },
    /// Notifications were dropped; the consumer must rescan the prefix.
    Resync,
}

impl WatchEvent {
    pub fn key(&self) -> Option<&str> {
        match self {
            WatchEvent::Created { key, .. }
            | WatchEvent::Updated { key, .. }
            | WatchEvent::Deleted { key } => Some(key),
            WatchEvent::Resync => None,
        }
    }

    fn matches(&self, prefix: &str) -> bool {
        self.key().map_or(true, |key| key.starts_with(prefix))
    }
}

#[derive(Debug)]
enum Source {
    Local(broadcast::Receiver<WatchEvent>),
    Remote(mpsc::Receiver<WatchEvent>),
}

/// A lazy stream of notifications for one prefix.
///
/// `next()` returns `None` only when the underlying source is gone (store
/// dropped or connection lost); calling [`crate::store::CasStore::watch`]
/// again restarts it, after which the consumer should rescan.
#[derive(Debug)]
pub struct Watch {
    prefix: String,
    source: Source,
}

impl Watch {
    pub(crate) fn local(prefix: &str, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.to_string(),
            source: Source::Local(rx),
        }
    }

    pub(crate) fn remote(prefix: &str, rx: mpsc::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.to_string(),
            source: Source::Remote(rx),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next notification under this prefix.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            let event = match &mut self.source {
                Source::Local(rx) => match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(prefix = %self.prefix, skipped, "watch_lagged");
                        WatchEvent::Resync
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                Source::Remote(rx) => rx.recv().await?,
            };
            if event.matches(&self.prefix) {
                return Some(event);
            }
        }
    }

    /// Adapt into a `Stream`.
    pub fn into_stream(self) -> BoxStream<'static, WatchEvent> {
        stream::unfold(self, |mut watch| async move {
            let event = watch.next().await?;
            Some((event, watch))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_filtering() {
        let (tx, rx) = broadcast::channel(16);
        let mut watch = Watch::local("/jobs/", rx);

        tx.send(WatchEvent::Created { key: "/leases/a".into(), version: 1 }).unwrap();
        tx.send(WatchEvent::Created { key: "/jobs/a".into(), version: 1 }).unwrap();

        let event = watch.next().await.unwrap();
        assert_eq!(event.key(), Some("/jobs/a"));
    }

    #[tokio::test]
    async fn test_lag_produces_resync() {
        let (tx, rx) = broadcast::channel(2);
        let mut watch = Watch::local("/", rx);

        for i in 0..5 {
            tx.send(WatchEvent::Deleted { key: format!("/k{}", i) }).unwrap();
        }

        assert_eq!(watch.next().await, Some(WatchEvent::Resync));
    }

    #[tokio::test]
    async fn test_closed_source_ends_stream() {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let mut stream = Watch::remote("/", rx).into_stream();
        assert!(stream.next().await.is_none());
    }
}
