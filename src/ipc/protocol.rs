//! Store wire messages.
//!
//! Every request frame carries a client-chosen `id` echoed by its response.
//! A `watch` request turns its connection into a one-way stream: one
//! response acknowledges the watch, then each notification arrives as a
//! `MSG_STREAM_CHUNK` frame until `MSG_STREAM_END`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::store::{Entry, WatchEvent};
use crate::types::{Error, SessionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body", rename_all = "snake_case")]
pub enum StoreRequest {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: Bytes,
        expected_version: Option<u64>,
    },
    Create {
        key: String,
        value: Bytes,
    },
    CreateEphemeral {
        key: String,
        value: Bytes,
        session: SessionId,
    },
    Delete {
        key: String,
        expected_version: Option<u64>,
    },
    List {
        prefix: String,
    },
    Watch {
        prefix: String,
    },
    OpenSession {
        ttl_ms: u64,
    },
    KeepAlive {
        session: SessionId,
    },
    CloseSession {
        session: SessionId,
    },
}

impl StoreRequest {
    pub fn op(&self) -> &'static str {
        match self {
            StoreRequest::Get { .. } => "get",
            StoreRequest::Set { .. } => "set",
            StoreRequest::Create { .. } => "create",
            StoreRequest::CreateEphemeral { .. } => "create_ephemeral",
            StoreRequest::Delete { .. } => "delete",
            StoreRequest::List { .. } => "list",
            StoreRequest::Watch { .. } => "watch",
            StoreRequest::OpenSession { .. } => "open_session",
            StoreRequest::KeepAlive { .. } => "keep_alive",
            StoreRequest::CloseSession { .. } => "close_session",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoreResponse {
    Entry(Entry),
    Version(u64),
    Keys(Vec<String>),
    Session(SessionId),
    Event(WatchEvent),
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: StoreRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub body: Option<StoreResponse>,
    #[serde(default)]
    pub error: Option<WireError>,
}

impl ResponseFrame {
    pub fn ok(id: u64, body: StoreResponse) -> Self {
        Self {
            id,
            ok: true,
            body: Some(body),
            error: None,
        }
    }

    pub fn err(id: u64, error: &Error) -> Self {
        Self {
            id,
            ok: false,
            body: None,
            error: Some(WireError {
                code: error.to_ipc_error_code().to_string(),
                message: error.to_string(),
            }),
        }
    }

    /// Turn the frame back into a library result.
    pub fn into_result(self) -> Result<StoreResponse, Error> {
        if self.ok {
            return self
                .body
                .ok_or_else(|| Error::internal(format!("response {} has no body", self.id)));
        }
        Err(match self.error {
            Some(WireError { code, message }) => Error::from_ipc_error(&code, message),
            None => Error::internal(format!("response {} failed without an error", self.id)),
        })
    }
}
