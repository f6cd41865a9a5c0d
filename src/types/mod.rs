//! Core types for jobkeeper.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (JobId, SessionId, WorkerId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the store server, workers and GC

mod config;
mod errors;
mod ids;

pub use config::{Config, GcConfig, IpcConfig, ObservabilityConfig, ServerConfig, WorkerConfig};
pub use errors::{Error, Result};
pub use ids::{JobId, SessionId, WorkerId};
