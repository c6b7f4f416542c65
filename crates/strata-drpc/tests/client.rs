//! dRPC client/server integration tests over real Unix sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use strata_core::{Context, ContextError};
use strata_drpc::*;

/// Tracks how many handler invocations overlap.
#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

fn slow_ping_server(
    path: &std::path::Path,
    local: Arc<Concurrency>,
    global: Arc<Concurrency>,
) -> DrpcListener {
    DrpcServer::new(path)
        .with_handler(
            Method::PingRank,
            handler(move |_| {
                let local = Arc::clone(&local);
                let global = Arc::clone(&global);
                async move {
                    local.enter();
                    global.enter();
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    global.exit();
                    local.exit();
                    reply(&EngineResp::default())
                }
            }),
        )
        .listen()
        .unwrap()
}

#[tokio::test]
async fn calls_to_one_engine_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine0.sock");
    let local = Arc::new(Concurrency::default());
    let global = Arc::new(Concurrency::default());
    let server_ctx = Context::background().with_cancel();
    let listener = slow_ping_server(&path, Arc::clone(&local), global);
    tokio::spawn(listener.serve(server_ctx.clone()));

    let client = Arc::new(DrpcClient::new(&path));
    let mut tasks = Vec::new();
    for rank in 0..5 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            client
                .request(&Context::background(), &PingRankReq { rank })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(local.max.load(Ordering::SeqCst), 1);
    server_ctx.cancel();
}

#[tokio::test]
async fn calls_to_different_engines_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let global = Arc::new(Concurrency::default());
    let server_ctx = Context::background().with_cancel();

    let mut clients = Vec::new();
    for idx in 0..2 {
        let path = dir.path().join(format!("engine{idx}.sock"));
        let listener =
            slow_ping_server(&path, Arc::new(Concurrency::default()), Arc::clone(&global));
        tokio::spawn(listener.serve(server_ctx.clone()));
        clients.push(Arc::new(DrpcClient::new(&path)));
    }

    let mut tasks = Vec::new();
    for client in &clients {
        let client = Arc::clone(client);
        tasks.push(tokio::spawn(async move {
            client
                .request(&Context::background(), &PingRankReq { rank: 0 })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(global.max.load(Ordering::SeqCst), 2);
    server_ctx.cancel();
}

#[tokio::test]
async fn failure_status_is_bad_status() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sock");
    let ctx = Context::background().with_cancel();
    let listener = DrpcServer::new(&path)
        .with_handler(
            Method::SetUp,
            handler(|_| async { Err("setup exploded".to_string()) }),
        )
        .listen()
        .unwrap();
    tokio::spawn(listener.serve(ctx.clone()));

    let client = DrpcClient::new(&path);
    let err = client.request(&Context::background(), &SetUpReq {}).await.unwrap_err();
    assert!(matches!(err, DrpcError::BadStatus(Status::Failure)));
    assert_eq!(err.to_string(), "bad status: FAILURE");
    ctx.cancel();
}

#[tokio::test]
async fn remote_status_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sock");
    let ctx = Context::background().with_cancel();
    let listener = DrpcServer::new(&path)
        .with_handler(
            Method::SetRank,
            handler(|_| async { reply(&EngineResp { status: -1003 }) }),
        )
        .listen()
        .unwrap();
    tokio::spawn(listener.serve(ctx.clone()));

    let client = DrpcClient::new(&path);
    let err = client
        .request(&Context::background(), &SetRankReq { rank: 1, map_version: 1 })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DrpcError::Remote {
            method: Method::SetRank,
            status: -1003
        }
    ));
    ctx.cancel();
}

#[tokio::test]
async fn retryable_status_is_resubmitted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sock");
    let ctx = Context::background().with_cancel();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let listener = DrpcServer::new(&path)
        .with_handler(
            Method::GroupUpdate,
            handler(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let status = if n < 2 { ERR_BUSY } else { 0 };
                    reply(&EngineResp { status })
                }
            }),
        )
        .listen()
        .unwrap();
    tokio::spawn(listener.serve(ctx.clone()));

    let client = DrpcClient::new(&path);
    let req = GroupUpdateReq {
        members: vec![],
        map_version: 2,
    };
    client.request(&Context::background(), &req).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    ctx.cancel();
}

#[tokio::test]
async fn retry_stops_at_context_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sock");
    let ctx = Context::background().with_cancel();
    let listener = DrpcServer::new(&path)
        .with_handler(
            Method::GroupUpdate,
            handler(|_| async { reply(&EngineResp { status: ERR_BUSY }) }),
        )
        .listen()
        .unwrap();
    tokio::spawn(listener.serve(ctx.clone()));

    let client = DrpcClient::new(&path);
    let req = GroupUpdateReq {
        members: vec![],
        map_version: 2,
    };
    let call_ctx = Context::background().with_timeout(Duration::from_millis(400));
    let err = client.request(&call_ctx, &req).await.unwrap_err();
    assert_eq!(err.context_error(), Some(ContextError::DeadlineExceeded));
    ctx.cancel();
}

/// Accepts a connection, reads the call, and never answers.
fn silent_listener(path: &std::path::Path) {
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
}

#[tokio::test]
async fn missing_response_honours_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sock");
    silent_listener(&path);

    let client = DrpcClient::new(&path);
    let ctx = Context::background().with_timeout(Duration::from_millis(100));
    let err = client.call(&ctx, Method::PingRank, vec![]).await.unwrap_err();
    assert!(matches!(err, DrpcError::Context(ContextError::DeadlineExceeded)));
}

#[tokio::test]
async fn missing_response_honours_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sock");
    silent_listener(&path);

    let client = Arc::new(DrpcClient::new(&path));
    let ctx = Context::background().with_cancel();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = client.call(&ctx, Method::PingRank, vec![]).await.unwrap_err();
    assert!(matches!(err, DrpcError::Context(ContextError::Canceled)));

    // The lock was released on cancellation: a later call still runs.
    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    let err = client.call(&ctx, Method::PingRank, vec![]).await.unwrap_err();
    assert!(matches!(err, DrpcError::Context(ContextError::DeadlineExceeded)));
}

#[tokio::test]
async fn closed_without_reply_is_no_response() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sock");
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            let _ = reader.read_line(&mut line).await;
        }
    });

    let client = DrpcClient::new(&path);
    let err = client
        .call(&Context::background(), Method::PingRank, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, DrpcError::NoResponse));
    assert_eq!(err.to_string(), "no response");
}

#[tokio::test]
async fn third_status_value_is_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sock");
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            let _ = reader.read_line(&mut line).await;
            let _ = writer
                .write_all(b"{\"sequence\":1,\"status\":7,\"body\":[]}\n")
                .await;
        }
    });

    let client = DrpcClient::new(&path);
    let err = client
        .call(&Context::background(), Method::PingRank, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, DrpcError::UnknownStatus(7)));
}
