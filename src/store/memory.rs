//! In-memory implementation of [`CasStore`].
//!
//! A single mutex serializes every operation, which makes the store trivially
//! linearizable. Session expiry is evaluated lazily on each operation and by
//! [`MemoryStore::sweep_expired`], which the store server runs periodically.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{CasStore, Entry, Watch, WatchEvent};
use crate::types::{Error, Result, SessionId};

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Session {
    ttl: Duration,
    expires_at: Instant,
    ephemeral_keys: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    sessions: HashMap<SessionId, Session>,
}

/// Thread-safe in-memory coordination store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    /// Expire every session past its deadline. Returns how many expired.
    pub fn sweep_expired(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        Ok(self.expire_sessions(&mut inner, Instant::now()))
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        self.expire_sessions(&mut inner, Instant::now());
        Ok(inner.sessions.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| Error::internal(format!("store lock poisoned: {}", e)))
    }

    /// Lock and expire overdue sessions before the caller's operation runs.
    fn lock_fresh(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock()?;
        self.expire_sessions(&mut inner, Instant::now());
        Ok(inner)
    }

    fn emit(&self, event: WatchEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn expire_sessions(&self, inner: &mut Inner, now: Instant) -> usize {
        let expired: Vec<SessionId> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            tracing::info!(session = %id, "session_expired");
            self.drop_session(inner, id);
        }
        expired.len()
    }

    fn drop_session(&self, inner: &mut Inner, id: &SessionId) -> bool {
        let Some(session) = inner.sessions.remove(id) else {
            return false;
        };
        for key in session.ephemeral_keys {
            if inner.entries.remove(&key).is_some() {
                self.emit(WatchEvent::Deleted { key });
            }
        }
        true
    }

    fn insert_new(&self, inner: &mut Inner, key: &str, value: Bytes, owner: Option<SessionId>) -> u64 {
        inner.entries.insert(
            key.to_string(),
            Entry {
                key: key.to_string(),
                value,
                version: 1,
                ephemeral_owner: owner,
            },
        );
        self.emit(WatchEvent::Created {
            key: key.to_string(),
            version: 1,
        });
        1
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CasStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Entry> {
        let inner = self.lock_fresh()?;
        inner
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key.to_string()))
    }

    async fn set(&self, key: &str, value: Bytes, expected_version: Option<u64>) -> Result<u64> {
        let mut inner = self.lock_fresh()?;

        if !inner.entries.contains_key(key) {
            if expected_version.is_some() {
                return Err(Error::not_found(key.to_string()));
            }
            return Ok(self.insert_new(&mut inner, key, value, None));
        }

        let entry = inner
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;

        if let Some(expected) = expected_version {
            if entry.version != expected {
                return Err(Error::version_conflict(format!(
                    "{}: expected version {}, found {}",
                    key, expected, entry.version
                )));
            }
        }

        entry.value = value;
        entry.version += 1;
        let version = entry.version;
        self.emit(WatchEvent::Updated {
            key: key.to_string(),
            version,
        });
        Ok(version)
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64> {
        let mut inner = self.lock_fresh()?;
        if inner.entries.contains_key(key) {
            return Err(Error::entry_exists(key.to_string()));
        }
        Ok(self.insert_new(&mut inner, key, value, None))
    }

    async fn create_ephemeral(&self, key: &str, value: Bytes, session: &SessionId) -> Result<u64> {
        let mut inner = self.lock_fresh()?;
        if !inner.sessions.contains_key(session) {
            return Err(Error::session_expired(session.to_string()));
        }
        if inner.entries.contains_key(key) {
            return Err(Error::entry_exists(key.to_string()));
        }

        let version = self.insert_new(&mut inner, key, value, Some(session.clone()));
        if let Some(s) = inner.sessions.get_mut(session) {
            s.ephemeral_keys.insert(key.to_string());
        }
        Ok(version)
    }

    async fn delete(&self, key: &str, expected_version: Option<u64>) -> Result<()> {
        let mut inner = self.lock_fresh()?;

        let entry = inner
            .entries
            .get(key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;

        if let Some(expected) = expected_version {
            if entry.version != expected {
                return Err(Error::version_conflict(format!(
                    "{}: expected version {}, found {}",
                    key, expected, entry.version
                )));
            }
        }

        if let Some(owner) = entry.ephemeral_owner.clone() {
            if let Some(session) = inner.sessions.get_mut(&owner) {
                session.ephemeral_keys.remove(key);
            }
        }
        inner.entries.remove(key);
        self.emit(WatchEvent::Deleted {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.lock_fresh()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<Watch> {
        Ok(Watch::local(prefix, self.events.subscribe()))
    }

    async fn open_session(&self, ttl: Duration) -> Result<SessionId> {
        if ttl.is_zero() {
            return Err(Error::validation("session ttl must be positive"));
        }
        let mut inner = self.lock_fresh()?;
        let id = SessionId::new();
        inner.sessions.insert(
            id.clone(),
            Session {
                ttl,
                expires_at: Instant::now() + ttl,
                ephemeral_keys: BTreeSet::new(),
            },
        );
        tracing::debug!(session = %id, ttl_ms = ttl.as_millis() as u64, "session_opened");
        Ok(id)
    }

    async fn keep_alive(&self, session: &SessionId) -> Result<()> {
        let mut inner = self.lock_fresh()?;
        let s = inner
            .sessions
            .get_mut(session)
            .ok_or_else(|| Error::session_expired(session.to_string()))?;
        s.expires_at = Instant::now() + s.ttl;
        Ok(())
    }

    async fn close_session(&self, session: &SessionId) -> Result<()> {
        let mut inner = self.lock_fresh()?;
        if self.drop_session(&mut inner, session) {
            tracing::debug!(session = %session, "session_closed");
        }
        Ok(())
    }
}
