//! jobkeeper coordination store server.
//!
//! Serves an in-memory CAS store over TCP for workers running in other
//! processes, and reaps jobs whose owners disappeared.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use jobkeeper::ipc::StoreServer;
use jobkeeper::{Backend, Config, GcService, MemoryStore};

#[derive(Debug, Parser)]
#[command(name = "jobkeeper-store", version, about = "jobkeeper coordination store server")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "JOBKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    jobkeeper::observability::init_tracing(&config.observability);

    let addr = config.server.listen_addr.parse()?;
    let store = MemoryStore::new();
    let server = Arc::new(StoreServer::new(
        store.clone(),
        config.ipc.clone(),
        config.server.session_sweep_interval,
    ));

    let mut gc = GcService::new(Backend::new(Arc::new(store)), config.gc.clone());
    let gc_handle = gc.start();

    let shutdown = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown_signal_received");
            shutdown.shutdown();
        }
    });

    tracing::info!(addr = %addr, version = env!("CARGO_PKG_VERSION"), "jobkeeper_store_starting");
    server.serve(addr).await?;

    gc.stop();
    if let Err(e) = gc_handle.await {
        tracing::warn!(error = %e, "gc_task_join_failed");
    }
    tracing::info!("jobkeeper_store_stopped");
    Ok(())
}
