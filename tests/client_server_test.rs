// Copyright 2026 Highway RPC Developers

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use slog::{debug, o, Drain, Level, LevelFilter, Logger};
use tokio::task::JoinHandle;

use highway_rpc::connection::ClientConnection;
use highway_rpc::dispatch::{DispatchError, Router};
use highway_rpc::invocation::InvocationContext;
use highway_rpc::pool::ConnectionPool;
use highway_rpc::{
    listen, Acceptor, ClientConfig, ClientRegistry, Connector, HighwayError, Request, Server,
    ServerConfig, StaticResolver, STATUS_OK, STATUS_SERVER_ERROR,
};

const SLOW_MS: u64 = 500;

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn router(log: &Logger) -> Router {
    let echo_log = log.clone();
    Router::new()
        .register("test", "echo", move |req: Request| {
            debug!(echo_log, "handling echo request"; "len" => req.body.len());
            async move { Ok::<_, DispatchError>(req.body) }
        })
        .register("test", "slow", |req: Request| async move {
            tokio::time::sleep(Duration::from_millis(SLOW_MS)).await;
            Ok::<_, DispatchError>(req.body)
        })
        .register("test", "missing", |_req: Request| async move {
            Err::<Bytes, _>(DispatchError::from("not found"))
        })
}

async fn start_server(log: &Logger) -> (Arc<Server>, String, JoinHandle<highway_rpc::Result<()>>) {
    let listener = listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Server::new(
        router(log),
        ServerConfig::default(),
        Acceptor::Plain,
        Some(log),
    );
    let handle = server.spawn(listener);
    (server, addr, handle)
}

fn pool_config(pool_size: usize) -> ClientConfig {
    ClientConfig {
        pool_size,
        ..ClientConfig::default()
    }
}

fn request(operation: &str, body: &[u8]) -> Request {
    Request::new("test-service", "test", operation, Bytes::copy_from_slice(body))
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn echo_round_trip() {
    let log = test_logger();
    let (server, addr, _handle) = start_server(&log).await;

    let pool = ConnectionPool::connect(&addr, &pool_config(1), Connector::Tcp, Some(&log))
        .await
        .unwrap();
    let resp = pool
        .call(7, &request("echo", b"ping"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(resp.status, STATUS_OK);
    assert_eq!(resp.body, Bytes::from_static(b"ping"));

    pool.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn echo_random_payloads() {
    let log = test_logger();
    let (server, addr, _handle) = start_server(&log).await;
    let pool = ConnectionPool::connect(&addr, &pool_config(2), Connector::Tcp, Some(&log))
        .await
        .unwrap();

    let mut rng = rand::thread_rng();
    for i in 1..50u64 {
        let mut body = vec![0u8; (i as usize) * 1000];
        rng.fill(&mut body[..]);
        let resp = pool
            .call(i, &request("echo", &body), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.body.as_ref(), &body[..]);
    }

    pool.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn call_times_out_and_is_unregistered() {
    let log = test_logger();
    let (server, addr, _handle) = start_server(&log).await;
    let pool = ConnectionPool::connect(&addr, &pool_config(1), Connector::Tcp, Some(&log))
        .await
        .unwrap();

    let err = pool
        .call(11, &request("slow", b"zzz"), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HighwayError::SendTimeout {
            correlation_id: 11,
            ..
        }
    ));

    let conn = pool.connection_at(pool.slot_for(11)).unwrap();
    assert!(!conn.pending_ids().contains(&11));
    // the late response is dropped and the connection keeps working
    tokio::time::sleep(Duration::from_millis(SLOW_MS + 100)).await;
    assert!(conn.is_open());
    let resp = pool
        .call(12, &request("echo", b"still here"), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(resp.is_ok());

    pool.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn dispatch_failure_becomes_error_response() {
    let log = test_logger();
    let (server, addr, _handle) = start_server(&log).await;
    let pool = ConnectionPool::connect(&addr, &pool_config(1), Connector::Tcp, Some(&log))
        .await
        .unwrap();

    let resp = pool
        .call(3, &request("missing", b""), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(resp.status, STATUS_SERVER_ERROR);
    assert_eq!(resp.reason, "not found");
    assert!(matches!(
        resp.into_result(),
        Err(HighwayError::Remote { status: STATUS_SERVER_ERROR, .. })
    ));

    let resp = pool
        .call(4, &request("no-such-op", b""), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(resp.status, STATUS_SERVER_ERROR);
    assert!(resp.reason.contains("not found"));

    pool.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn congruent_ids_share_a_connection() {
    let log = test_logger();
    let (server, addr, _handle) = start_server(&log).await;
    let pool = ConnectionPool::connect(&addr, &pool_config(4), Connector::Tcp, Some(&log))
        .await
        .unwrap();
    assert_eq!(pool.size(), 4);
    assert_eq!(pool.slot_for(5), 1);
    assert_eq!(pool.slot_for(9), 1);

    let timeout = Duration::from_secs(5);
    let req_a = request("slow", b"five");
    let req_b = request("echo", b"nine");
    let (a, b) = tokio::join!(pool.call(5, &req_a, timeout), pool.call(9, &req_b, timeout));
    assert_eq!(a.unwrap().body, Bytes::from_static(b"five"));
    assert_eq!(b.unwrap().body, Bytes::from_static(b"nine"));

    pool.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn close_fails_every_pending_call() {
    let log = test_logger();
    let (server, addr, _handle) = start_server(&log).await;
    let conn = ClientConnection::connect(&addr, &Connector::Tcp, Duration::from_secs(5), Some(&log))
        .await
        .unwrap();

    let mut waiters = Vec::new();
    for id in 1..=3u64 {
        let frame = request("slow", b"x").to_frame(id).unwrap();
        let (ctx, rx) = InvocationContext::new(frame);
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.send_two_way(ctx).await });
        waiters.push(rx);
    }
    wait_until(|| conn.pending_count() == 3).await;
    assert_eq!(conn.pending_ids(), vec![1, 2, 3]);

    conn.close().await;
    for rx in waiters {
        assert!(matches!(rx.await.unwrap(), Err(HighwayError::ConnectionClosed)));
    }
    assert_eq!(conn.pending_count(), 0);
    assert!(conn.is_closed());

    server.shutdown().await;
}

#[tokio::test]
async fn registry_reuses_pools_and_invokes_through_resolver() {
    let log = test_logger();
    let (server, addr, _handle) = start_server(&log).await;
    let registry = ClientRegistry::new(pool_config(2), Connector::Tcp, Some(&log));

    let first = registry.get_client(&addr).await.unwrap();
    let second = registry.get_client(&addr).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let resp = registry.call(&addr, &request("echo", b"hello")).await.unwrap();
    assert_eq!(resp.body, Bytes::from_static(b"hello"));

    let resolver = StaticResolver(addr.clone());
    let resp = registry
        .invoke(&resolver, &request("echo", b"resolved"))
        .await
        .unwrap();
    assert_eq!(resp.body, Bytes::from_static(b"resolved"));

    registry.post(&addr, &request("echo", b"one-way")).await.unwrap();

    registry.close_all().await;
    assert!(!registry.contains(&addr));
    assert!(first.is_closed());

    server.shutdown().await;
}

#[tokio::test]
async fn stalled_destination_does_not_block_others() {
    let log = test_logger();
    let (server, good, _handle) = start_server(&log).await;
    // accepts at the TCP level but never answers the login
    let stalled = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled_addr = stalled.local_addr().unwrap().to_string();

    let config = ClientConfig {
        pool_size: 1,
        connect_timeout_ms: 1500,
        ..ClientConfig::default()
    };
    let registry = Arc::new(ClientRegistry::new(config, Connector::Tcp, Some(&log)));
    let background = {
        let registry = Arc::clone(&registry);
        let addr = stalled_addr.clone();
        tokio::spawn(async move { registry.get_client(&addr).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    registry.get_client(&good).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(registry.contains(&good));

    assert!(matches!(
        background.await.unwrap(),
        Err(HighwayError::Handshake(_))
    ));
    assert!(!registry.contains(&stalled_addr));

    registry.close_all().await;
    drop(stalled);
    server.shutdown().await;
}

#[tokio::test]
async fn server_close_all_fails_in_flight_calls() {
    let log = test_logger();
    let (server, addr, _handle) = start_server(&log).await;
    let pool = ConnectionPool::connect(&addr, &pool_config(1), Connector::Tcp, Some(&log))
        .await
        .unwrap();
    wait_until(|| server.connection_count() == 1).await;

    let slow = request("slow", b"x");
    let call = pool.call(21, &slow, Duration::from_secs(5));
    let close = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close_all().await;
    };
    let (res, ()) = tokio::join!(call, close);
    assert!(matches!(res, Err(HighwayError::ConnectionClosed)));
    wait_until(|| server.connection_count() == 0).await;

    // the dead slot is redialed by the next call
    let resp = pool
        .call(22, &request("echo", b"again"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(resp.body, Bytes::from_static(b"again"));

    pool.close().await;
    server.shutdown().await;
}
