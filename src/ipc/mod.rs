//! TCP+msgpack transport for the CAS store.
//!
//! [`StoreServer`] exposes a [`crate::store::MemoryStore`] over length-prefixed
//! msgpack frames; [`RemoteStore`] is the matching [`crate::store::CasStore`]
//! client used by workers in other processes.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod router;
pub mod server;

pub use client::RemoteStore;
pub use server::StoreServer;
