//! IPC integration tests: RemoteStore ↔ StoreServer over real TCP.

use bytes::Bytes;
use jobkeeper::backend::{JobStatus, JobsControl};
use jobkeeper::codec::{Call, Extra, MethodTable, Step};
use jobkeeper::ipc::codec::{
    decode_msgpack, read_frame, write_frame, MSG_ERROR, MSG_REQUEST, MSG_RESPONSE,
};
use jobkeeper::ipc::protocol::ResponseFrame;
use jobkeeper::ipc::{RemoteStore, StoreServer};
use jobkeeper::store::WatchEvent;
use jobkeeper::types::{IpcConfig, WorkerConfig};
use jobkeeper::{Backend, CasStore, Error, MemoryStore, WorkerPool};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Helper: serve a fresh store on a random port.
async fn start_test_server() -> (SocketAddr, Arc<StoreServer>) {
    start_server_with(IpcConfig::default()).await
}

async fn start_server_with(ipc_config: IpcConfig) -> (SocketAddr, Arc<StoreServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(StoreServer::new(
        MemoryStore::new(),
        ipc_config,
        Duration::from_millis(50),
    ));

    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve_on(listener).await;
    });
    (addr, server)
}

async fn connect(addr: SocketAddr) -> RemoteStore {
    RemoteStore::connect(addr.to_string(), IpcConfig::default())
        .await
        .unwrap()
}

/// Poll until `key` is gone, or give up after a second.
async fn wait_until_absent(store: &impl CasStore, key: &str) -> bool {
    for _ in 0..50 {
        if matches!(store.get(key).await, Err(Error::NotFound(_))) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_cas_round_trip() {
    let (addr, _server) = start_test_server().await;
    let store = connect(addr).await;

    assert_eq!(store.set("/a", Bytes::from_static(b"1"), None).await.unwrap(), 1);
    assert_eq!(store.set("/a", Bytes::from_static(b"2"), Some(1)).await.unwrap(), 2);

    let stale = store.set("/a", Bytes::from_static(b"3"), Some(1)).await.unwrap_err();
    assert!(matches!(stale, Error::VersionConflict(_)));
    assert!(stale.is_retryable());

    let entry = store.get("/a").await.unwrap();
    assert_eq!(entry.value, Bytes::from_static(b"2"));
    assert_eq!(entry.version, 2);

    assert!(matches!(
        store.create("/a", Bytes::new()).await,
        Err(Error::EntryExists(_))
    ));
    assert!(matches!(store.get("/missing").await, Err(Error::NotFound(_))));
    assert!(matches!(
        store.set("/missing", Bytes::new(), Some(1)).await,
        Err(Error::NotFound(_))
    ));

    store.create("/b/1", Bytes::new()).await.unwrap();
    store.create("/b/0", Bytes::new()).await.unwrap();
    assert_eq!(store.list("/b/").await.unwrap(), vec!["/b/0", "/b/1"]);

    store.delete("/a", Some(2)).await.unwrap();
    assert!(matches!(store.get("/a").await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_ephemeral_keys_follow_their_session() {
    let (addr, _server) = start_test_server().await;
    let store = connect(addr).await;

    let session = store.open_session(Duration::from_secs(30)).await.unwrap();
    store
        .create_ephemeral("/leases/a", Bytes::from_static(b"x"), &session)
        .await
        .unwrap();
    assert_eq!(store.get("/leases/a").await.unwrap().ephemeral_owner, Some(session.clone()));

    store.keep_alive(&session).await.unwrap();
    store.close_session(&session).await.unwrap();
    assert!(matches!(store.get("/leases/a").await, Err(Error::NotFound(_))));
    assert!(matches!(
        store.keep_alive(&session).await,
        Err(Error::SessionExpired(_))
    ));
}

#[tokio::test]
async fn test_sessions_expire_without_keepalive() {
    let (addr, server) = start_test_server().await;
    let store = connect(addr).await;

    let session = store.open_session(Duration::from_millis(100)).await.unwrap();
    store
        .create_ephemeral("/leases/b", Bytes::new(), &session)
        .await
        .unwrap();

    assert!(wait_until_absent(&store, "/leases/b").await);
    assert_eq!(server.store().session_count().unwrap(), 0);
}

#[tokio::test]
async fn test_disconnect_closes_sessions() {
    let (addr, _server) = start_test_server().await;
    let observer = connect(addr).await;

    let worker = connect(addr).await;
    let session = worker.open_session(Duration::from_secs(30)).await.unwrap();
    worker
        .create_ephemeral("/leases/c", Bytes::new(), &session)
        .await
        .unwrap();
    assert!(observer.get("/leases/c").await.is_ok());

    drop(worker);
    assert!(wait_until_absent(&observer, "/leases/c").await);
}

#[tokio::test]
async fn test_lost_request_connection_spares_sessions() {
    let (addr, server) = start_server_with(IpcConfig {
        max_frame_bytes: 1024,
        ..IpcConfig::default()
    })
    .await;
    let store = connect(addr).await;

    let session = store.open_session(Duration::from_secs(30)).await.unwrap();
    store
        .create_ephemeral("/leases/d", Bytes::from_static(b"x"), &session)
        .await
        .unwrap();

    // An oversized frame makes the server drop the shared connection.
    let err = store
        .set("/big", Bytes::from(vec![0u8; 4096]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)), "got {:?}", err);

    store.keep_alive(&session).await.unwrap();
    let entry = store.get("/leases/d").await.unwrap();
    assert_eq!(entry.ephemeral_owner, Some(session.clone()));
    assert_eq!(server.store().session_count().unwrap(), 1);

    store.close_session(&session).await.unwrap();
    assert!(matches!(store.get("/leases/d").await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_watch_streams_changes() {
    let (addr, _server) = start_test_server().await;
    let store = connect(addr).await;

    let mut watch = store.watch("/jobs/").await.unwrap();
    assert_eq!(watch.prefix(), "/jobs/");

    store.create("/other", Bytes::new()).await.unwrap();
    store.create("/jobs/1", Bytes::new()).await.unwrap();
    store.set("/jobs/1", Bytes::from_static(b"v"), Some(1)).await.unwrap();
    store.delete("/jobs/1", None).await.unwrap();

    let mut events = Vec::new();
    while events.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(2), watch.next())
            .await
            .unwrap()
            .unwrap();
        events.push(event);
    }
    assert!(matches!(&events[0], WatchEvent::Created { key, version: 1 } if key == "/jobs/1"));
    assert!(matches!(&events[1], WatchEvent::Updated { key, version: 2 } if key == "/jobs/1"));
    assert!(matches!(&events[2], WatchEvent::Deleted { key } if key == "/jobs/1"));
}

#[tokio::test]
async fn test_server_shutdown_ends_watch() {
    let (addr, server) = start_test_server().await;
    let store = connect(addr).await;
    let mut watch = store.watch("/").await.unwrap();

    server.shutdown();
    let ended = tokio::time::timeout(Duration::from_secs(2), watch.next())
        .await
        .unwrap();
    assert!(ended.is_none());

    // Let the request connection observe the shutdown too.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let err = store.get("/x").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_malformed_request_gets_error_frame() {
    let (addr, _server) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let payload = rmp_serde::to_vec_named(&json!({"id": 9, "request": {"op": "frobnicate"}})).unwrap();
    write_frame(&mut stream, MSG_REQUEST, &payload).await.unwrap();

    let (msg_type, body) = read_frame(&mut stream, 1024 * 1024).await.unwrap().unwrap();
    assert_eq!(msg_type, MSG_ERROR);
    let frame: ResponseFrame = decode_msgpack(&body).unwrap();
    assert!(!frame.ok);
    assert!(matches!(frame.into_result(), Err(Error::Validation(_))));

    // The connection survives and keeps serving.
    let payload = rmp_serde::to_vec_named(&json!({"id": 10, "request": {"op": "list", "body": {"prefix": "/"}}})).unwrap();
    write_frame(&mut stream, MSG_REQUEST, &payload).await.unwrap();
    let (msg_type, body) = read_frame(&mut stream, 1024 * 1024).await.unwrap().unwrap();
    assert_eq!(msg_type, MSG_RESPONSE);
    let frame: ResponseFrame = decode_msgpack(&body).unwrap();
    assert_eq!(frame.id, 10);
    assert!(frame.ok);
}

#[tokio::test]
async fn test_worker_pool_over_remote_store() {
    let (addr, server) = start_test_server().await;
    let backend = Backend::new(Arc::new(connect(addr).await));

    let methods = MethodTable::new().with("square", |kwargs, _ctx| async move {
        let x = kwargs.get("x").and_then(Value::as_i64).unwrap_or(0);
        Ok(Step::Return(json!(x * x)))
    });
    let config = WorkerConfig {
        pool_size: 2,
        poll_interval: Duration::from_millis(50),
        session_ttl: Duration::from_secs(5),
        keepalive_interval: Duration::from_secs(1),
    };
    let mut pool = WorkerPool::new(backend.clone(), methods, config).unwrap();
    pool.start();

    let mut jobs = Vec::new();
    for x in 0..5 {
        let call = Call::new("square").arg("x", &x).unwrap();
        jobs.push((x, backend.submit(call, Extra::new()).await.unwrap()));
    }
    for (x, job_id) in &jobs {
        let end = tokio::time::timeout(Duration::from_secs(5), backend.wait_result(job_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end.return_value, Some(json!(x * x)));
    }

    pool.shutdown().await;
    let (record, _) = backend.get(&jobs[0].1).await.unwrap();
    assert_eq!(record.status, JobStatus::Done);
    assert_eq!(server.store().session_count().unwrap(), 0);
}
