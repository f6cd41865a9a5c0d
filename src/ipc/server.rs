//! TCP store server: accept loop and per-connection handler.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

use crate::ipc::codec::{
    decode_msgpack, encode_msgpack, read_frame, write_frame, MSG_ERROR, MSG_REQUEST, MSG_RESPONSE,
    MSG_STREAM_CHUNK, MSG_STREAM_END,
};
use crate::ipc::protocol::{RequestFrame, ResponseFrame, StoreResponse};
use crate::ipc::router::{route_request, ConnectionSessions, RouteResponse};
use crate::store::{MemoryStore, Watch};
use crate::types::{Error, IpcConfig};

/// Serves a [`MemoryStore`] over TCP.
#[derive(Debug)]
pub struct StoreServer {
    store: MemoryStore,
    ipc_config: IpcConfig,
    sweep_interval: Duration,
    cancel: CancellationToken,
}

impl StoreServer {
    pub fn new(store: MemoryStore, ipc_config: IpcConfig, sweep_interval: Duration) -> Self {
        Self {
            store,
            ipc_config,
            sweep_interval,
            cancel: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Bind `addr` and serve until cancelled.
    pub async fn serve(&self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    pub async fn serve_on(&self, listener: TcpListener) -> std::io::Result<()> {
        let conn_semaphore = Arc::new(Semaphore::new(self.ipc_config.max_connections));
        tracing::info!(
            addr = %listener.local_addr()?,
            max_connections = self.ipc_config.max_connections,
            "store_server_listening"
        );

        let sweeper = self.spawn_sweeper();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("store_server_shutting_down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    // Backpressure when at capacity.
                    let permit = match Arc::clone(&conn_semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                peer = %peer,
                                max_connections = self.ipc_config.max_connections,
                                "connection_rejected"
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!(
                        peer = %peer,
                        active = self.ipc_config.max_connections - conn_semaphore.available_permits(),
                        "connection_accepted"
                    );
                    let store = self.store.clone();
                    let cancel = self.cancel.clone();
                    let ipc_config = self.ipc_config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, store, cancel, ipc_config, permit).await {
                            tracing::warn!(peer = %peer, error = %e, "connection_error");
                        }
                    });
                }
            }
        }
        sweeper.abort();
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        let period = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match store.sweep_expired() {
                        Ok(0) => {}
                        Ok(expired) => tracing::info!(expired, "sessions_expired"),
                        Err(e) => tracing::error!(error = %e, "session_sweep_failed"),
                    },
                }
            }
        })
    }
}

/// Handle a single TCP connection: read frames → route → write responses.
async fn handle_connection(
    stream: TcpStream,
    store: MemoryStore,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut sessions = ConnectionSessions::default();
    let result = serve_requests(&mut reader, &mut writer, &store, &cancel, &ipc_config, &mut sessions).await;
    sessions.close_all(&store).await;
    result
}

async fn serve_requests(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    store: &MemoryStore,
    cancel: &CancellationToken,
    ipc_config: &IpcConfig,
    sessions: &mut ConnectionSessions,
) -> std::io::Result<()> {
    let read_timeout = Duration::from_secs(ipc_config.read_timeout_secs);
    let write_timeout = Duration::from_secs(ipc_config.write_timeout_secs);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame_result = tokio::time::timeout(read_timeout, read_frame(reader, ipc_config.max_frame_bytes)) => {
                let (msg_type, payload) = match frame_result {
                    Err(_elapsed) => {
                        tracing::debug!(timeout_secs = ipc_config.read_timeout_secs, "read_timeout");
                        break;
                    }
                    Ok(result) => match result? {
                        Some(frame) => frame,
                        None => break, // clean EOF
                    },
                };

                if msg_type != MSG_REQUEST {
                    let err = Error::validation(format!("unexpected message type: 0x{:02X}", msg_type));
                    send(writer, MSG_ERROR, &ResponseFrame::err(0, &err), write_timeout).await?;
                    continue;
                }
                let frame: RequestFrame = match decode_msgpack(&payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let err = Error::validation(e.to_string());
                        send(writer, MSG_ERROR, &ResponseFrame::err(0, &err), write_timeout).await?;
                        continue;
                    }
                };

                let id = frame.id;
                let op = frame.request.op();
                match route_request(store, frame.request, sessions).await {
                    Ok(RouteResponse::Single(body)) => {
                        send(writer, MSG_RESPONSE, &ResponseFrame::ok(id, body), write_timeout).await?;
                    }
                    Ok(RouteResponse::Stream(watch)) => {
                        send(writer, MSG_RESPONSE, &ResponseFrame::ok(id, StoreResponse::Done), write_timeout).await?;
                        return stream_watch(reader, writer, id, watch, cancel, ipc_config).await;
                    }
                    Err(e) => {
                        tracing::debug!(op, error = %e, "request_failed");
                        send(writer, MSG_ERROR, &ResponseFrame::err(id, &e), write_timeout).await?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Stream watch notifications until the watch ends, the client hangs up or
/// the server shuts down. The connection serves nothing else afterwards.
async fn stream_watch(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    id: u64,
    mut watch: Watch,
    cancel: &CancellationToken,
    ipc_config: &IpcConfig,
) -> std::io::Result<()> {
    let write_timeout = Duration::from_secs(ipc_config.write_timeout_secs);
    tracing::debug!(prefix = %watch.prefix(), "watch_stream_started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            // Anything from the client, EOF included, ends the stream.
            _ = read_frame(reader, ipc_config.max_frame_bytes) => return Ok(()),
            event = watch.next() => match event {
                Some(event) => {
                    let chunk = ResponseFrame::ok(id, StoreResponse::Event(event));
                    send(writer, MSG_STREAM_CHUNK, &chunk, write_timeout).await?;
                }
                None => break,
            },
        }
    }
    send(writer, MSG_STREAM_END, &ResponseFrame::ok(id, StoreResponse::Done), write_timeout).await
}

/// Encode and write a frame with a timeout, so slow consumers cannot hold a
/// connection indefinitely.
async fn send(
    writer: &mut OwnedWriteHalf,
    msg_type: u8,
    frame: &ResponseFrame,
    timeout: Duration,
) -> std::io::Result<()> {
    let payload = encode_msgpack(frame)?;
    tokio::time::timeout(timeout, write_frame(writer, msg_type, &payload))
        .await
        .map_err(|_| {
            tracing::warn!(timeout_secs = timeout.as_secs(), "write_timeout");
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}
