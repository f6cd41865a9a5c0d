//! [`RemoteStore`]: a [`CasStore`] reached over the store wire protocol.
//!
//! The server closes every session opened on a connection when that
//! connection drops. Each session therefore gets a connection of its own,
//! carrying its `open_session`, `create_ephemeral`, `keep_alive` and
//! `close_session` requests, so a transport failure expires at most one
//! session. Every other request goes over a shared connection.
//!
//! Any transport failure drops the affected connection and surfaces as
//! `Error::ConnectionLost`; the next request reconnects. A session whose
//! connection was lost is gone on the server, so its later requests fail
//! with `SessionExpired`.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::ipc::codec::{
    decode_msgpack, encode_msgpack, read_frame, write_frame, MSG_ERROR, MSG_REQUEST, MSG_RESPONSE,
    MSG_STREAM_CHUNK, MSG_STREAM_END,
};
use crate::ipc::protocol::{RequestFrame, ResponseFrame, StoreRequest, StoreResponse};
use crate::store::{CasStore, Entry, Watch, WatchEvent};
use crate::types::{Error, IpcConfig, Result, SessionId};

/// Client side of [`crate::ipc::StoreServer`].
#[derive(Debug)]
pub struct RemoteStore {
    addr: String,
    ipc_config: IpcConfig,
    request_timeout: Duration,
    conn: Connection,
    sessions: Mutex<HashMap<SessionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

/// A lazily (re)opened connection; `None` after a transport failure.
type Connection = Mutex<Option<TcpStream>>;

impl RemoteStore {
    pub fn new(addr: impl Into<String>, ipc_config: IpcConfig) -> Self {
        let request_timeout = Duration::from_secs(ipc_config.write_timeout_secs.max(1) * 3);
        Self {
            addr: addr.into(),
            ipc_config,
            request_timeout,
            conn: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Connect eagerly so address errors surface at startup.
    pub async fn connect(addr: impl Into<String>, ipc_config: IpcConfig) -> Result<Self> {
        let store = Self::new(addr, ipc_config);
        let stream = store.open_connection().await?;
        *store.conn.lock().await = Some(stream);
        Ok(store)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn open_connection(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::connection_lost(format!("connect {}: {}", self.addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::connection_lost(format!("configure {}: {}", self.addr, e)))?;
        Ok(stream)
    }

    async fn call(&self, request: StoreRequest) -> Result<StoreResponse> {
        self.call_on(&self.conn, request).await
    }

    /// Connection dedicated to `session`. Sessions this client never
    /// opened (or already closed) use the shared connection.
    async fn session_conn(&self, session: &SessionId) -> Option<Arc<Connection>> {
        self.sessions.lock().await.get(session).cloned()
    }

    async fn call_for_session(&self, session: &SessionId, request: StoreRequest) -> Result<StoreResponse> {
        match self.session_conn(session).await {
            Some(conn) => self.call_on(&conn, request).await,
            None => self.call(request).await,
        }
    }

    async fn call_on(&self, conn: &Connection, request: StoreRequest) -> Result<StoreResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let op = request.op();
        let payload = encode_msgpack(&RequestFrame { id, request })
            .map_err(|e| Error::encoding(format!("{} request: {}", op, e)))?;

        let mut guard = conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_connection().await?);
            tracing::debug!(addr = %self.addr, "store_connected");
        }
        let Some(stream) = guard.as_mut() else {
            return Err(Error::connection_lost("no connection"));
        };

        let exchange = tokio::time::timeout(
            self.request_timeout,
            round_trip(stream, &payload, self.ipc_config.max_frame_bytes),
        )
        .await;
        let frame = match exchange {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                *guard = None;
                tracing::warn!(addr = %self.addr, op, error = %e, "store_connection_lost");
                return Err(Error::connection_lost(format!("{}: {}", op, e)));
            }
            Err(_elapsed) => {
                *guard = None;
                tracing::warn!(addr = %self.addr, op, "store_request_timeout");
                return Err(Error::connection_lost(format!("{}: request timed out", op)));
            }
        };
        drop(guard);

        if frame.id != id {
            return Err(Error::internal(format!(
                "response id {} does not match request {}",
                frame.id, id
            )));
        }
        frame.into_result()
    }
}

async fn round_trip(stream: &mut TcpStream, payload: &[u8], max_frame_bytes: u32) -> std::io::Result<ResponseFrame> {
    write_frame(stream, MSG_REQUEST, payload).await?;
    match read_frame(stream, max_frame_bytes).await? {
        Some((MSG_RESPONSE | MSG_ERROR, body)) => decode_msgpack(&body),
        Some((other, _)) => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected message type: 0x{:02X}", other),
        )),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "server closed the connection",
        )),
    }
}

fn unexpected(op: &str, response: StoreResponse) -> Error {
    Error::internal(format!("unexpected {} response: {:?}", op, response))
}

#[async_trait]
impl CasStore for RemoteStore {
    async fn get(&self, key: &str) -> Result<Entry> {
        match self.call(StoreRequest::Get { key: key.to_string() }).await? {
            StoreResponse::Entry(entry) => Ok(entry),
            other => Err(unexpected("get", other)),
        }
    }

    async fn set(&self, key: &str, value: Bytes, expected_version: Option<u64>) -> Result<u64> {
        let request = StoreRequest::Set {
            key: key.to_string(),
            value,
            expected_version,
        };
        match self.call(request).await? {
            StoreResponse::Version(version) => Ok(version),
            other => Err(unexpected("set", other)),
        }
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64> {
        let request = StoreRequest::Create {
            key: key.to_string(),
            value,
        };
        match self.call(request).await? {
            StoreResponse::Version(version) => Ok(version),
            other => Err(unexpected("create", other)),
        }
    }

    async fn create_ephemeral(&self, key: &str, value: Bytes, session: &SessionId) -> Result<u64> {
        let request = StoreRequest::CreateEphemeral {
            key: key.to_string(),
            value,
            session: session.clone(),
        };
        match self.call_for_session(session, request).await? {
            StoreResponse::Version(version) => Ok(version),
            other => Err(unexpected("create_ephemeral", other)),
        }
    }

    async fn delete(&self, key: &str, expected_version: Option<u64>) -> Result<()> {
        let request = StoreRequest::Delete {
            key: key.to_string(),
            expected_version,
        };
        match self.call(request).await? {
            StoreResponse::Done => Ok(()),
            other => Err(unexpected("delete", other)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        match self.call(StoreRequest::List { prefix: prefix.to_string() }).await? {
            StoreResponse::Keys(keys) => Ok(keys),
            other => Err(unexpected("list", other)),
        }
    }

    /// Opens a dedicated connection for the stream.
    async fn watch(&self, prefix: &str) -> Result<Watch> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RequestFrame {
            id,
            request: StoreRequest::Watch {
                prefix: prefix.to_string(),
            },
        };
        let payload = encode_msgpack(&request).map_err(|e| Error::encoding(e.to_string()))?;

        let mut stream = self.open_connection().await?;
        let ack = tokio::time::timeout(
            self.request_timeout,
            round_trip(&mut stream, &payload, self.ipc_config.max_frame_bytes),
        )
        .await
        .map_err(|_| Error::connection_lost("watch: request timed out"))?
        .map_err(|e| Error::connection_lost(format!("watch: {}", e)))?;
        ack.into_result()?;

        let (tx, rx) = mpsc::channel(self.ipc_config.stream_channel_capacity.max(1));
        let max_frame_bytes = self.ipc_config.max_frame_bytes;
        let prefix_owned = prefix.to_string();
        tokio::spawn(async move {
            pump_watch(stream, tx, max_frame_bytes).await;
            tracing::debug!(prefix = %prefix_owned, "remote_watch_ended");
        });
        Ok(Watch::remote(prefix, rx))
    }

    async fn open_session(&self, ttl: Duration) -> Result<SessionId> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let conn = Arc::new(Mutex::new(Some(self.open_connection().await?)));
        match self.call_on(&conn, StoreRequest::OpenSession { ttl_ms }).await? {
            StoreResponse::Session(session) => {
                self.sessions.lock().await.insert(session.clone(), conn);
                Ok(session)
            }
            other => Err(unexpected("open_session", other)),
        }
    }

    async fn keep_alive(&self, session: &SessionId) -> Result<()> {
        match self
            .call_for_session(session, StoreRequest::KeepAlive { session: session.clone() })
            .await?
        {
            StoreResponse::Done => Ok(()),
            other => Err(unexpected("keep_alive", other)),
        }
    }

    async fn close_session(&self, session: &SessionId) -> Result<()> {
        let request = StoreRequest::CloseSession { session: session.clone() };
        let closed = self.call_for_session(session, request).await;
        // Dropping the dedicated connection closes the session server-side
        // even when the request itself failed.
        self.sessions.lock().await.remove(session);
        match closed? {
            StoreResponse::Done => Ok(()),
            other => Err(unexpected("close_session", other)),
        }
    }
}

/// Forward stream chunks into the watch channel. A full channel drops
/// events and queues a `Resync` for when the consumer catches up.
async fn pump_watch(mut stream: TcpStream, tx: mpsc::Sender<WatchEvent>, max_frame_bytes: u32) {
    let mut lagged = false;
    loop {
        let frame = tokio::select! {
            _ = tx.closed() => return,
            frame = read_frame(&mut stream, max_frame_bytes) => frame,
        };
        let event = match frame {
            Ok(Some((MSG_STREAM_CHUNK, body))) => match decode_msgpack::<ResponseFrame>(&body).map(ResponseFrame::into_result) {
                Ok(Ok(StoreResponse::Event(event))) => event,
                Ok(Ok(other)) => {
                    tracing::warn!(response = ?other, "unexpected_watch_chunk");
                    continue;
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "watch_error_chunk");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "watch_chunk_undecodable");
                    return;
                }
            },
            Ok(Some((MSG_STREAM_END, _))) | Ok(None) => return,
            Ok(Some((other, _))) => {
                tracing::warn!(msg_type = other, "unexpected_watch_frame");
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "watch_connection_lost");
                return;
            }
        };

        if lagged {
            match tx.try_send(WatchEvent::Resync) {
                Ok(()) => lagged = false,
                Err(mpsc::error::TrySendError::Full(_)) => continue,
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => lagged = true,
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}
