/// End-to-end tests: a real unix-socket listener in front of a real TCP
/// upstream, exercising transparency, connection reuse, backpressure, and
/// graceful shutdown.
use mypooler::server::{Pool, PoolOptions, ProxyServer};
use mypooler::MypoolerError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};

/// TCP echo server standing in for MySQL; counts accepted connections.
async fn spawn_echo_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = accepts.clone();

    tokio::spawn(async move {
        loop {
            if let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        }
    });

    (addr, accepts)
}

fn build_server(
    upstream: SocketAddr,
    dir: &TempDir,
    max_size: usize,
    wait_timeout: Duration,
    max_lifetime: Duration,
) -> Arc<ProxyServer> {
    let pool = Pool::new(PoolOptions {
        host: upstream.ip().to_string(),
        port: upstream.port(),
        max_size,
        max_lifetime,
        wait_timeout,
    });
    Arc::new(ProxyServer::new(pool, dir.path().join("mypooler.socket")))
}

/// Spawn `run` and wait until a bound socket shows up at the path. Mere
/// existence is not enough: a stale regular file planted before `run` would
/// satisfy that check before the listener has actually bound.
async fn start(server: &Arc<ProxyServer>) {
    use std::os::unix::fs::FileTypeExt;
    let runner = server.clone();
    tokio::spawn(async move { runner.run().await });
    for _ in 0..200 {
        let bound = server
            .socket_path()
            .metadata()
            .map(|m| m.file_type().is_socket())
            .unwrap_or(false);
        if bound {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("server did not bind in time");
}

#[tokio::test]
async fn relays_bytes_exactly_in_both_directions() {
    let (upstream, _accepts) = spawn_echo_upstream().await;
    let dir = TempDir::new().unwrap();
    let server = build_server(
        upstream,
        &dir,
        4,
        Duration::from_millis(500),
        Duration::ZERO,
    );
    start(&server).await;

    let mut client = UnixStream::connect(server.socket_path()).await.unwrap();

    // Arbitrary binary payload, sent in chunks; the echo must come back
    // byte-identical and in order.
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(700) {
        client.write_all(chunk).await.unwrap();
    }

    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn sequential_clients_reuse_the_same_upstream_connection() {
    let (upstream, accepts) = spawn_echo_upstream().await;
    let dir = TempDir::new().unwrap();
    let server = build_server(
        upstream,
        &dir,
        1,
        Duration::from_millis(500),
        Duration::from_secs(3600),
    );
    start(&server).await;

    for message in [&b"ping"[..], &b"pong"[..]] {
        let mut client = UnixStream::connect(server.socket_path()).await.unwrap();
        client.write_all(message).await.unwrap();
        let mut reply = vec![0u8; message.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, message);
        drop(client);

        // Let the session finish and return the connection.
        for _ in 0..100 {
            if server.live_sessions() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    assert_eq!(
        accepts.load(Ordering::SeqCst),
        1,
        "second client must reuse the pooled connection, not dial"
    );
    let stats = server.pool().stats().await;
    assert_eq!(stats.created, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.outstanding, 0);
}

#[tokio::test]
async fn saturated_pool_refuses_the_extra_client_after_the_wait_window() {
    let (upstream, _accepts) = spawn_echo_upstream().await;
    let dir = TempDir::new().unwrap();
    let server = build_server(
        upstream,
        &dir,
        1,
        Duration::from_millis(100),
        Duration::ZERO,
    );
    start(&server).await;

    // First client binds the only connection and keeps it.
    let mut holder = UnixStream::connect(server.socket_path()).await.unwrap();
    holder.write_all(b"held").await.unwrap();
    let mut reply = [0u8; 4];
    holder.read_exact(&mut reply).await.unwrap();

    // Second client is refused: immediate close after roughly the wait
    // window, not a hang and not an instant rejection.
    let started = Instant::now();
    let mut refused = UnixStream::connect(server.socket_path()).await.unwrap();
    let mut buf = [0u8; 1];
    let n = refused.read(&mut buf).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(n, 0, "refused client must see a clean close, no bytes");
    assert!(elapsed >= Duration::from_millis(80), "refused too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "refused too late: {:?}", elapsed);

    // The holder's session is unaffected.
    holder.write_all(b"more").await.unwrap();
    holder.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"more");
}

#[tokio::test]
async fn expired_connection_is_replaced_by_a_fresh_dial() {
    let (upstream, accepts) = spawn_echo_upstream().await;
    let dir = TempDir::new().unwrap();
    let server = build_server(
        upstream,
        &dir,
        1,
        Duration::from_millis(500),
        Duration::from_millis(50),
    );
    start(&server).await;

    for message in [&b"one."[..], &b"two."[..]] {
        let mut client = UnixStream::connect(server.socket_path()).await.unwrap();
        client.write_all(message).await.unwrap();
        let mut reply = vec![0u8; message.len()];
        client.read_exact(&mut reply).await.unwrap();
        drop(client);

        for _ in 0..100 {
            if server.live_sessions() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Outlive the connection's max lifetime before the next client.
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    assert_eq!(
        accepts.load(Ordering::SeqCst),
        2,
        "expired connection must not be handed out again"
    );
}

#[tokio::test]
async fn binding_fails_fast_when_upstream_is_unreachable() {
    // Bind then drop so the port refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let dir = TempDir::new().unwrap();
    let server = build_server(
        dead_addr,
        &dir,
        2,
        Duration::from_millis(500),
        Duration::ZERO,
    );
    start(&server).await;

    let mut client = UnixStream::connect(server.socket_path()).await.unwrap();
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "dial failure must surface as an immediate close");
}

#[tokio::test]
async fn shutdown_drains_sessions_and_stops_accepting() {
    let (upstream, _accepts) = spawn_echo_upstream().await;
    let dir = TempDir::new().unwrap();
    let server = build_server(
        upstream,
        &dir,
        2,
        Duration::from_millis(500),
        Duration::ZERO,
    );
    start(&server).await;

    // An idle-but-bound session that shutdown must cancel.
    let mut client = UnixStream::connect(server.socket_path()).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();

    server.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(server.live_sessions(), 0);
    assert!(
        !server.socket_path().exists(),
        "socket file must be removed on shutdown"
    );
    assert!(
        UnixStream::connect(server.socket_path()).await.is_err(),
        "a shut-down proxy must not accept"
    );

    // The cancelled session's client sees its connection dropped.
    let n = client.read(&mut reply).await.unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn shutdown_with_no_sessions_is_safe_and_idempotent() {
    let (upstream, _accepts) = spawn_echo_upstream().await;
    let dir = TempDir::new().unwrap();
    let server = build_server(
        upstream,
        &dir,
        2,
        Duration::from_millis(500),
        Duration::ZERO,
    );
    start(&server).await;

    server.shutdown(Duration::from_secs(1)).await.unwrap();
    // Second call is a no-op, not an error.
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn shutdown_reports_timeout_when_sessions_cannot_drain() {
    let (upstream, _accepts) = spawn_echo_upstream().await;
    let dir = TempDir::new().unwrap();
    let server = build_server(
        upstream,
        &dir,
        2,
        Duration::from_millis(500),
        Duration::ZERO,
    );
    start(&server).await;

    let mut client = UnixStream::connect(server.socket_path()).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();

    // Zero deadline: the live session cannot possibly deregister in time.
    let err = server.shutdown(Duration::ZERO).await.unwrap_err();
    assert!(matches!(
        err,
        MypoolerError::ShutdownTimeout { active } if active == 1
    ));
}

#[tokio::test]
async fn stale_socket_file_is_removed_before_binding() {
    let (upstream, _accepts) = spawn_echo_upstream().await;
    let dir = TempDir::new().unwrap();
    let server = build_server(
        upstream,
        &dir,
        2,
        Duration::from_millis(500),
        Duration::ZERO,
    );

    // Simulate a socket file left behind by a crashed predecessor.
    std::fs::write(server.socket_path(), b"").unwrap();

    start(&server).await;
    let mut client = UnixStream::connect(server.socket_path()).await.unwrap();
    client.write_all(b"ok").await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ok");
}

#[tokio::test]
async fn two_proxies_can_coexist_in_one_process() {
    let (upstream_a, _) = spawn_echo_upstream().await;
    let (upstream_b, _) = spawn_echo_upstream().await;
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let server_a = build_server(
        upstream_a,
        &dir_a,
        1,
        Duration::from_millis(500),
        Duration::ZERO,
    );
    let server_b = build_server(
        upstream_b,
        &dir_b,
        1,
        Duration::from_millis(500),
        Duration::ZERO,
    );
    start(&server_a).await;
    start(&server_b).await;

    for server in [&server_a, &server_b] {
        let mut client = UnixStream::connect(server.socket_path()).await.unwrap();
        client.write_all(b"test").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"test");
    }
}
