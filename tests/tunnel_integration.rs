//! End-to-end tests driving the real control plane and client dialer over
//! loopback TCP, covering the seed scenarios from spec.md's testable
//! properties section (S1 happy path, S2 port conflict, S4 pool exhaustion,
//! S5 client disconnect, S6 TLS round-trip).

use std::net::IpAddr;
use std::time::Duration;

use revtun::client::{Client, ServerRejected};
use revtun::protocol::TOKEN_LEN;
use revtun::server::Server;
use revtun::transport::Kind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// Grabs a currently-free port by binding to port 0 and releasing it. Racy in
/// theory, but the standard way to pick loopback ports for test harnesses.
async fn free_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind ephemeral port")
        .local_addr()
        .unwrap()
        .port()
}

fn make_server(control_port: u16, min_port: u16, max_port: u16, password: &str) -> Server {
    Server {
        bind_addr: localhost(),
        control_port: Some(control_port),
        control_tls_port: None,
        tls_cert: None,
        tls_key: None,
        password: password.to_string(),
        min_port,
        max_port,
    }
}

fn make_client(
    server_port: u16,
    remote_port: u16,
    local_port: u16,
    kind: Kind,
    password: &str,
) -> Client {
    Client {
        local_host: "127.0.0.1".to_string(),
        local_port,
        server_host: "127.0.0.1".to_string(),
        server_port,
        remote_port,
        kind,
        tls_verify: false,
        password: password.to_string(),
        restart: false,
    }
}

/// Spawns a loopback echo server and returns the port it is bound to.
async fn spawn_echo_app() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_happy_path_relays_bytes_between_visitor_and_app() {
    let control_port = free_port().await;
    let remote_port = free_port().await;
    let min_port = free_port().await;
    let max_port = min_port.saturating_add(20);

    tokio::spawn(make_server(control_port, min_port, max_port, "").listen());
    sleep(Duration::from_millis(100)).await;

    let app_port = spawn_echo_app().await;
    let client = make_client(control_port, remote_port, app_port, Kind::Plain, "");
    tokio::spawn(async move { client.run().await });
    sleep(Duration::from_millis(200)).await;

    let mut visitor = TcpStream::connect(("127.0.0.1", remote_port))
        .await
        .expect("visitor should be able to reach the public port");
    visitor.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 5];
    visitor.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_second_client_on_same_remote_port_is_rejected() {
    let control_port = free_port().await;
    let remote_port = free_port().await;
    let min_port = free_port().await;
    let max_port = min_port.saturating_add(20);

    tokio::spawn(make_server(control_port, min_port, max_port, "").listen());
    sleep(Duration::from_millis(100)).await;

    let app_port = spawn_echo_app().await;
    let first = make_client(control_port, remote_port, app_port, Kind::Plain, "");
    tokio::spawn(async move { first.run().await });
    sleep(Duration::from_millis(150)).await;

    let second = make_client(control_port, remote_port, app_port, Kind::Plain, "");
    let err = second
        .run()
        .await
        .expect_err("second client must be rejected for requesting a held port");
    let rejected = err
        .downcast_ref::<ServerRejected>()
        .expect("rejection must surface as ServerRejected");
    assert_eq!(rejected.0, "port in use");

    // The first session should still be usable after the conflict.
    let mut visitor = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
    visitor.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    visitor.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_mismatched_token_dial_is_rejected_but_the_real_client_still_completes() {
    let control_port = free_port().await;
    let remote_port = free_port().await;
    // Pool of exactly one tunnel port, so the attacker's dial target is known.
    let min_port = free_port().await;
    let max_port = min_port + 1;

    tokio::spawn(make_server(control_port, min_port, max_port, "").listen());
    sleep(Duration::from_millis(100)).await;

    let app_port = spawn_echo_app().await;
    let client = make_client(control_port, remote_port, app_port, Kind::Plain, "");
    tokio::spawn(async move { client.run().await });
    sleep(Duration::from_millis(150)).await;

    // A visitor connecting makes the broker reserve the sole tunnel port and
    // notify the client to dial it back.
    let mut visitor = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();

    // An attacker races the legitimate client to the known tunnel port and
    // presents a bogus token. The broker must reject it without closing the
    // listener, so the legitimate client's dial-back still wins the splice.
    sleep(Duration::from_millis(30)).await;
    if let Ok(mut attacker) = TcpStream::connect(("127.0.0.1", min_port)).await {
        let _ = attacker.write_all(&vec![0xAAu8; TOKEN_LEN]).await;
        drop(attacker);
    }

    visitor.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    visitor
        .read_exact(&mut buf)
        .await
        .expect("legitimate client should still verify and relay after a rejected dial");
    assert_eq!(&buf, b"ping");
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_tunnel_pool_exhaustion_drops_extra_visitor_but_session_continues() {
    let control_port = free_port().await;
    let remote_port = free_port().await;
    // Pool of exactly one tunnel port.
    let min_port = free_port().await;
    let max_port = min_port + 1;

    tokio::spawn(make_server(control_port, min_port, max_port, "").listen());
    sleep(Duration::from_millis(100)).await;

    let app_port = spawn_echo_app().await;
    let client = make_client(control_port, remote_port, app_port, Kind::Plain, "");
    tokio::spawn(async move { client.run().await });
    sleep(Duration::from_millis(150)).await;

    // First visitor takes the only tunnel port and holds the connection open.
    let mut visitor1 = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
    visitor1.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    visitor1.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // Give the broker time to have reserved the sole tunnel port before the
    // second visitor's reserve_any would otherwise race it.
    sleep(Duration::from_millis(50)).await;

    // Second visitor arrives while the pool is exhausted: it must be closed
    // without ever completing a round trip, while the first stays alive.
    let mut visitor2 = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(2), visitor2.read(&mut buf)).await;
    match closed {
        Ok(Ok(0)) => {} // clean close, as expected
        Ok(Ok(n)) => panic!("dropped visitor unexpectedly received {n} bytes"),
        Ok(Err(_)) => {} // reset is also an acceptable "dropped" signal
        Err(_) => panic!("dropped visitor's connection was never closed"),
    }

    // First visitor is still being served.
    visitor1.write_all(b"pong").await.unwrap();
    visitor1.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    // Once the first visitor goes away the port is released and a third
    // visitor succeeds.
    drop(visitor1);
    sleep(Duration::from_millis(200)).await;

    let mut visitor3 = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
    visitor3.write_all(b"again").await.unwrap();
    let mut buf3 = [0u8; 5];
    visitor3.read_exact(&mut buf3).await.unwrap();
    assert_eq!(&buf3, b"again");
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_client_disconnect_releases_the_remote_port() {
    let control_port = free_port().await;
    let remote_port = free_port().await;
    let min_port = free_port().await;
    let max_port = min_port.saturating_add(20);

    tokio::spawn(make_server(control_port, min_port, max_port, "").listen());
    sleep(Duration::from_millis(100)).await;

    let app_port = spawn_echo_app().await;
    let client = make_client(control_port, remote_port, app_port, Kind::Plain, "");
    let handle = tokio::spawn(async move { client.run().await });
    sleep(Duration::from_millis(150)).await;

    // Confirm the session is actually active before tearing it down.
    let mut visitor = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
    visitor.write_all(b"up").await.unwrap();
    let mut buf = [0u8; 2];
    visitor.read_exact(&mut buf).await.unwrap();
    drop(visitor);

    // Simulate an abrupt client disconnect by killing its task, which drops
    // the control connection.
    handle.abort();
    sleep(Duration::from_millis(300)).await;

    let second_app_port = spawn_echo_app().await;
    let second = make_client(control_port, remote_port, second_app_port, Kind::Plain, "");
    tokio::spawn(async move { second.run().await });
    sleep(Duration::from_millis(200)).await;

    let mut visitor2 = TcpStream::connect(("127.0.0.1", remote_port))
        .await
        .expect("remote port should be reusable once the prior session is torn down");
    visitor2.write_all(b"new").await.unwrap();
    let mut buf2 = [0u8; 3];
    visitor2.read_exact(&mut buf2).await.unwrap();
    assert_eq!(&buf2, b"new");
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_tls_round_trip_uses_tls_for_control_and_every_tunnel_dial() {
    let (cert_path, key_path) = write_self_signed_cert();

    let control_tls_port = free_port().await;
    let remote_port = free_port().await;
    let min_port = free_port().await;
    let max_port = min_port.saturating_add(20);

    let server = Server {
        bind_addr: localhost(),
        control_port: None,
        control_tls_port: Some(control_tls_port),
        tls_cert: Some(cert_path),
        tls_key: Some(key_path),
        password: String::new(),
        min_port,
        max_port,
    };
    tokio::spawn(server.listen());
    sleep(Duration::from_millis(150)).await;

    let app_port = spawn_echo_app().await;
    let client = make_client(control_tls_port, remote_port, app_port, Kind::Tls, "");
    tokio::spawn(async move { client.run().await });
    sleep(Duration::from_millis(250)).await;

    let mut visitor = TcpStream::connect(("127.0.0.1", remote_port))
        .await
        .expect("visitor dials the public port in plaintext regardless of the session's transport");
    visitor.write_all(b"secure").await.unwrap();
    let mut buf = [0u8; 6];
    visitor.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"secure");
}

fn write_self_signed_cert() -> (std::path::PathBuf, std::path::PathBuf) {
    let cert_key = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("self-signed cert generation");

    let dir = std::env::temp_dir().join(format!(
        "revtun-test-{}-{}",
        std::process::id(),
        fastrand::u64(..)
    ));
    std::fs::create_dir_all(&dir).unwrap();

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert_key.cert.pem()).unwrap();
    std::fs::write(&key_path, cert_key.key_pair.serialize_pem()).unwrap();

    (cert_path, key_path)
}
