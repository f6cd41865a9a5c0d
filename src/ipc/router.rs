//! Request router: applies one decoded request to the store.

use std::collections::HashSet;
use std::time::Duration;

use crate::ipc::protocol::{StoreRequest, StoreResponse};
use crate::store::{CasStore, MemoryStore, Watch};
use crate::types::{Error, Result, SessionId};

/// Result from routing a request.
#[derive(Debug)]
pub enum RouteResponse {
    /// Single response frame.
    Single(StoreResponse),
    /// Watch stream; the server writes each event as MSG_STREAM_CHUNK.
    Stream(Watch),
}

/// Sessions opened over one connection. They are closed when it drops.
#[derive(Debug, Default)]
pub struct ConnectionSessions {
    open: HashSet<SessionId>,
}

impl ConnectionSessions {
    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Close every session still open on this connection.
    pub async fn close_all(&mut self, store: &MemoryStore) {
        for session in self.open.drain() {
            match store.close_session(&session).await {
                Ok(()) | Err(Error::SessionExpired(_)) => {
                    tracing::debug!(session = %session, "connection_session_closed");
                }
                Err(e) => tracing::warn!(session = %session, error = %e, "connection_session_close_failed"),
            }
        }
    }
}

/// Route a store request.
pub async fn route_request(
    store: &MemoryStore,
    request: StoreRequest,
    sessions: &mut ConnectionSessions,
) -> Result<RouteResponse> {
    let response = match request {
        StoreRequest::Get { key } => StoreResponse::Entry(store.get(&key).await?),
        StoreRequest::Set {
            key,
            value,
            expected_version,
        } => StoreResponse::Version(store.set(&key, value, expected_version).await?),
        StoreRequest::Create { key, value } => StoreResponse::Version(store.create(&key, value).await?),
        StoreRequest::CreateEphemeral { key, value, session } => {
            StoreResponse::Version(store.create_ephemeral(&key, value, &session).await?)
        }
        StoreRequest::Delete { key, expected_version } => {
            store.delete(&key, expected_version).await?;
            StoreResponse::Done
        }
        StoreRequest::List { prefix } => StoreResponse::Keys(store.list(&prefix).await?),
        StoreRequest::Watch { prefix } => return Ok(RouteResponse::Stream(store.watch(&prefix).await?)),
        StoreRequest::OpenSession { ttl_ms } => {
            if ttl_ms == 0 {
                return Err(Error::validation("session ttl must be positive"));
            }
            let session = store.open_session(Duration::from_millis(ttl_ms)).await?;
            sessions.open.insert(session.clone());
            StoreResponse::Session(session)
        }
        StoreRequest::KeepAlive { session } => {
            store.keep_alive(&session).await?;
            StoreResponse::Done
        }
        StoreRequest::CloseSession { session } => {
            sessions.open.remove(&session);
            store.close_session(&session).await?;
            StoreResponse::Done
        }
    };
    Ok(RouteResponse::Single(response))
}
