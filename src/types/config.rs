//! Configuration structures.
//!
//! Configuration is loaded from an optional JSON file and then overridden by
//! `JOBKEEPER_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Coordination store server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// IPC transport configuration.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Garbage collection configuration.
    #[serde(default)]
    pub gc: GcConfig,
}

impl Config {
    /// Load configuration from an optional JSON file, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str(&raw)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process env in production).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("JOBKEEPER_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Some(level) = lookup("JOBKEEPER_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("JOBKEEPER_LOG_FORMAT") {
            self.observability.json_logs = format.eq_ignore_ascii_case("json");
        }
        if let Some(size) = lookup("JOBKEEPER_POOL_SIZE") {
            self.worker.pool_size = size
                .parse()
                .map_err(|_| Error::validation(format!("invalid JOBKEEPER_POOL_SIZE: {}", size)))?;
        }
        if let Some(ttl) = lookup("JOBKEEPER_SESSION_TTL") {
            self.worker.session_ttl = humantime_serde::re::humantime::parse_duration(&ttl)
                .map_err(|e| Error::validation(format!("invalid JOBKEEPER_SESSION_TTL: {}", e)))?;
        }
        Ok(())
    }
}

/// Coordination store server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Store server bind address (TCP).
    pub listen_addr: String,

    /// How often the server sweeps expired sessions.
    #[serde(with = "humantime_serde")]
    pub session_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7411".to_string(),
            session_sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// IPC transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Bounded channel capacity for watch streams.
    pub stream_channel_capacity: usize,

    /// Maximum concurrent TCP connections.
    pub max_connections: usize,

    /// Read timeout in seconds per frame on request connections. Watch
    /// connections are exempt since they only write.
    pub read_timeout_secs: u64,

    /// Write timeout in seconds per frame.
    pub write_timeout_secs: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
            stream_channel_capacity: 256,
            max_connections: 1000,
            read_timeout_secs: 300,
            write_timeout_secs: 10,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub pool_size: usize,

    /// Fallback poll interval when no watch notification arrives.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Session TTL; an unrefreshed session expires and its leases vanish.
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,

    /// Keepalive interval; must be shorter than `session_ttl`.
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            poll_interval: Duration::from_secs(5),
            session_ttl: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

/// Garbage collection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// How often to run a GC cycle.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// How long finished job records are retained before removal.
    #[serde(with = "humantime_serde")]
    pub ended_retention: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            ended_retention: Duration::from_secs(24 * 3600),
        }
    }
}
