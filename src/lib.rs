//! # jobkeeper - resumable, checkpointed job execution
//!
//! Jobs are explicit continuations: a serialized [`codec::State`] plus a
//! stack of resume [`codec::Frame`]s. Workers claim jobs through a
//! linearizable CAS store, checkpoint at every suspension point and finish
//! each job exactly once. A crashed worker's session expires, its leases
//! vanish, and the reaper hands the job back to the pool from its last
//! checkpoint.
//!
//! ## Architecture
//!
//! ```text
//!   Coordinator (rules) ──submit──┐
//!                                 ▼
//!   WorkerPool ── JobThread ── Backend<S> ── CasStore ── MemoryStore
//!                                 ▲                  └─ RemoteStore ─TCP─ StoreServer
//!   GcService ───────reap─────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod codec;
pub mod engine;
pub mod ipc;
pub mod rules;
pub mod store;
pub mod types;
pub mod worker;

// Internal utilities
pub mod observability;
pub mod recovery;

pub use backend::{Backend, Coordinator, GcService, JobsControl, JobsGc, JobsProcess};
pub use codec::{Call, MethodTable, State, Step};
pub use store::{CasStore, MemoryStore};
pub use types::{Config, Error, Result};
pub use worker::WorkerPool;
