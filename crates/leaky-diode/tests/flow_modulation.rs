//! End-to-end leaks over the flow-modulation channel on loopback.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use leaky_diode::{ChannelParameters, LeakyClient, LeakyServer, ServerConfig};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

fn params() -> ChannelParameters {
    ChannelParameters::flow_modulation()
        .low(20_000)
        .high(200_000)
        .settle_time(Duration::from_millis(100))
        .sample_time(Duration::from_millis(200))
        .build()
        .expect("valid flow parameters")
}

async fn start_server(secret: &[u8]) -> (LeakyServer, u16) {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), secret.to_vec());
    let mut server = LeakyServer::new(config, params()).unwrap();
    let addr = server.start().await.unwrap();
    (server, addr.port())
}

async fn wait_for_active(server: &LeakyServer, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.active_connections() != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {expected} active connections, have {}",
            server.active_connections()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leaks_one_byte_over_one_connection() {
    let (mut server, port) = start_server(&[0x5A]).await;
    let mut client = LeakyClient::new("127.0.0.1", port, params());
    client.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let secret = loop {
        assert!(tokio::time::Instant::now() < deadline, "leak did not finish");
        let (secret, finished) = client
            .get_secret(true, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        // The whole session shares a single connection.
        assert!(server.active_connections() <= 1);
        if finished {
            break secret;
        }
    };
    assert_eq!(secret, vec![0x5A]);
    assert_eq!(client.total_bits(), Some(24));

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_idles_until_first_index() {
    let (mut server, port) = start_server(b"x").await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let mut buf = [0u8; 1024];
    let idle = tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
    assert!(idle.is_err(), "server sent data before any request");

    leaky_diode::wire::write_index(&mut stream, 0).await.unwrap();
    let n = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
        .await
        .expect("filler after a request")
        .unwrap();
    assert!(n > 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_closes_streaming_connections() {
    let (mut server, port) = start_server(b"x").await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    leaky_diode::wire::write_index(&mut stream, 0).await.unwrap();

    let mut buf = [0u8; 4096];
    assert!(stream.read(&mut buf).await.unwrap() > 0);

    let stopped = tokio::time::timeout(Duration::from_secs(1), server.stop()).await;
    assert!(stopped.is_ok(), "stop did not interrupt the throttle");

    // Drain what was in flight; the stream must then end.
    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "connection left open after stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_stop_and_drop_release_the_session_connection() {
    let (mut server, port) = start_server(&[0xA5; 64]).await;

    let mut client = LeakyClient::new("127.0.0.1", port, params());
    client.start().await.unwrap();
    wait_for_active(&server, 1).await;
    // Mid-settle or mid-sample, stop closes the stream.
    tokio::time::sleep(Duration::from_millis(150)).await;
    client.stop().await;
    wait_for_active(&server, 0).await;

    let mut client = LeakyClient::new("127.0.0.1", port, params());
    client.start().await.unwrap();
    wait_for_active(&server, 1).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    drop(client);
    wait_for_active(&server, 0).await;

    server.stop().await;
}
