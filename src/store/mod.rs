//! CAS storage client contract.
//!
//! The job engine needs four things from its coordination service:
//! - linearizable reads and compare-and-swap writes with per-key versions,
//! - create-if-absent,
//! - ephemeral keys bound to a session that vanish when the session expires,
//! - prefix watches so workers and reapers react without tight polling.
//!
//! [`MemoryStore`] is the reference implementation; [`crate::ipc::RemoteStore`]
//! reaches a `MemoryStore` served over TCP by [`crate::ipc::StoreServer`].

mod memory;
mod watch;

pub use memory::MemoryStore;
pub use watch::{Watch, WatchEvent};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{Result, SessionId};

/// A stored entry. `version` starts at 1 on creation and increases by one on
/// every successful write to the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Bytes,
    pub version: u64,
    /// Session owning this key when it was created ephemeral.
    pub ephemeral_owner: Option<SessionId>,
}

/// Linearizable key-value store with CAS, sessions and watches.
///
/// Every operation may fail with `Error::ConnectionLost`; the outcome of a
/// write that failed that way is unknown and callers must re-read.
#[async_trait]
pub trait CasStore: Send + Sync + 'static {
    /// Read a key. `Error::NotFound` if absent.
    async fn get(&self, key: &str) -> Result<Entry>;

    /// Write a key.
    ///
    /// With `expected_version = None` the write is an unconditional upsert.
    /// Otherwise it fails with `Error::NotFound` if the key is absent and
    /// `Error::VersionConflict` if the stored version differs, leaving the
    /// entry untouched.
    async fn set(&self, key: &str, value: Bytes, expected_version: Option<u64>) -> Result<u64>;

    /// Create a key that must not exist yet (`Error::EntryExists` otherwise).
    async fn create(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Create a key owned by `session`; deleted when the session ends.
    async fn create_ephemeral(&self, key: &str, value: Bytes, session: &SessionId) -> Result<u64>;

    /// Delete a key, optionally conditional on its version.
    async fn delete(&self, key: &str, expected_version: Option<u64>) -> Result<()>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Change notifications for keys under `prefix`.
    async fn watch(&self, prefix: &str) -> Result<Watch>;

    /// Open a session that expires unless refreshed within `ttl`.
    async fn open_session(&self, ttl: Duration) -> Result<SessionId>;

    /// Refresh a session. `Error::SessionExpired` if it is already gone.
    async fn keep_alive(&self, session: &SessionId) -> Result<()>;

    /// Close a session and drop its ephemeral keys.
    async fn close_session(&self, session: &SessionId) -> Result<()>;
}
