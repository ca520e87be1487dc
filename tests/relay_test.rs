// Copyright 2025 the Portward authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use portward::config::SocketTuning;
use portward::entry::HostPort;
use portward::forwarder::Forwarder;
use portward::relay::{Connection, ConnectionEvent, ConnectionListener};

/// Grab a port the OS considers free right now.
async fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo server accepting any number of connections, each copied back to
/// itself until EOF. Returns the port it listens on.
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

/// Server that accepts a connection and immediately drops it.
async fn spawn_slamming_server() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            drop(stream);
        }
    });
    port
}

/// Start a forwarder to `target_port` and wait until it is bound.
async fn start_forwarder(local_port: u16, target_port: u16) -> Arc<Forwarder> {
    let target = HostPort::parse(&format!("localhost:{target_port}")).unwrap();
    let forwarder = Forwarder::new(local_port, target, SocketTuning::default());
    tokio::spawn(Arc::clone(&forwarder).run());
    for _ in 0..200 {
        if forwarder.is_bound() || forwarder.is_closed() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(forwarder.is_bound(), "forwarder failed to bind");
    forwarder
}

#[tokio::test]
async fn forwards_traffic_both_ways() {
    let echo_port = spawn_echo_server().await;
    let local_port = free_port().await;
    let forwarder = start_forwarder(local_port, echo_port).await;

    let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    client.write_all(b"hello portward!").await.unwrap();

    let mut received = vec![0u8; b"hello portward!".len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut received))
        .await
        .expect("timed out waiting for the echo")
        .unwrap();
    assert_eq!(&received, b"hello portward!");

    forwarder.close();
}

#[tokio::test]
async fn preserves_byte_order_across_many_buffers() {
    let echo_port = spawn_echo_server().await;
    let local_port = free_port().await;
    let forwarder = start_forwarder(local_port, echo_port).await;

    let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();

    // distinct chunks so any reordering or duplication shows up
    let mut expected = Vec::new();
    for i in 0u32..100 {
        let chunk = format!("chunk-{i:04};").into_bytes();
        expected.extend_from_slice(&chunk);
        client.write_all(&chunk).await.unwrap();
    }

    let mut received = vec![0u8; expected.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut received))
        .await
        .expect("timed out waiting for the echoed chunks")
        .unwrap();
    assert_eq!(received, expected);

    forwarder.close();
}

#[tokio::test]
async fn upstream_hangup_cascades_to_the_client() {
    let slam_port = spawn_slamming_server().await;
    let local_port = free_port().await;
    let forwarder = start_forwarder(local_port, slam_port).await;

    let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    let mut sink = Vec::new();
    // the upstream leg dies immediately; the client leg must be closed in
    // turn rather than left hanging
    let read = timeout(Duration::from_secs(5), client.read_to_end(&mut sink))
        .await
        .expect("client leg was not closed after the upstream hangup");
    assert!(matches!(read, Ok(0)));

    forwarder.close();
}

#[tokio::test]
async fn close_is_idempotent_and_releases_the_port() {
    let echo_port = spawn_echo_server().await;
    let local_port = free_port().await;
    let forwarder = start_forwarder(local_port, echo_port).await;

    forwarder.close();
    forwarder.close();
    assert!(forwarder.is_closed());
    assert!(!forwarder.is_bound());

    // once the accept loop exits the listener is gone and the port rebinds
    let mut rebound = None;
    for _ in 0..200 {
        match TcpListener::bind(("127.0.0.1", local_port)).await {
            Ok(listener) => {
                rebound = Some(listener);
                break;
            }
            Err(_) => sleep(Duration::from_millis(10)).await,
        }
    }
    assert!(rebound.is_some(), "closed forwarder kept its port bound");
}

#[tokio::test]
async fn dial_failure_does_not_kill_the_accept_loop() {
    // nothing listens on the target port, so every relay setup fails
    let dead_port = free_port().await;
    let local_port = free_port().await;
    let forwarder = start_forwarder(local_port, dead_port).await;

    for _ in 0..3 {
        let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        let mut sink = Vec::new();
        let _ = timeout(Duration::from_secs(5), client.read_to_end(&mut sink)).await;
    }
    assert!(forwarder.is_bound());
    assert!(!forwarder.is_closed());

    forwarder.close();
}

#[tokio::test]
async fn io_error_marks_the_connection_closed() {
    let slam_port = spawn_slamming_server().await;
    let tuning = SocketTuning::default();
    let conn = Connection::connect("127.0.0.1", slam_port, &tuning)
        .await
        .unwrap();
    conn.start();

    // the peer hangs up immediately; the resulting error must flip the
    // closed flag, not just stop the loops
    for _ in 0..200 {
        if conn.is_closed() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(conn.is_closed());
}

struct Capture {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ConnectionListener for Capture {
    fn data_received(&self, event: &ConnectionEvent) {
        if let Some(data) = &event.data {
            let _ = self.tx.send(data.clone());
        }
    }

    fn error_raised(&self, _event: &ConnectionEvent) {}
}

#[tokio::test]
async fn connection_counts_bytes_and_closes_once() {
    let echo_port = spawn_echo_server().await;
    let tuning = SocketTuning::default();
    let conn = Connection::connect("127.0.0.1", echo_port, &tuning)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.add_listener(Arc::new(Capture { tx }));
    conn.start();

    conn.send(b"ping".to_vec());
    let echoed = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for echoed data")
        .unwrap();
    assert_eq!(echoed, b"ping");
    assert_eq!(conn.total_read(), 4);
    // the send task counts after write_all returns, give it a moment
    for _ in 0..200 {
        if conn.total_written() == 4 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(conn.total_written(), 4);

    conn.close();
    conn.close();
    assert!(conn.is_closed());
    // sends after close are dropped, not queued
    conn.send(b"late".to_vec());
    assert_eq!(conn.total_written(), 4);
}
