//! Integration tests for the stallboard server.
//!
//! These tests exercise the full stack over real TCP sockets: framing,
//! login, roster reads and writes, broadcast fan-out and the graceful
//! shutdown drain.

use server::network::Server;
use shared::{AssigneeName, ClientMessage, DutyKind, Frame, ServerMessage, SlotKey};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<watch::Sender<bool>>,
    registry: Arc<server::registry::ClientRegistry>,
    handle: JoinHandle<io::Result<()>>,
}

async fn start_server() -> TestServer {
    let server = Server::new("127.0.0.1:0").await.expect("bind failed");
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_sender();
    let registry = server.registry();
    let handle = tokio::spawn(server.run());

    TestServer {
        addr,
        shutdown,
        registry,
        handle,
    }
}

async fn login(stream: &mut TcpStream, credential: &[u8]) -> bool {
    ClientMessage::Login {
        credential: credential.to_vec(),
    }
    .encode()
    .write_to(stream)
    .await
    .unwrap();

    match read_message(stream).await {
        ServerMessage::LoginResponse { accepted } => accepted,
        other => panic!("expected login response, got {:?}", other),
    }
}

async fn get_assignment(stream: &mut TcpStream, key: SlotKey) -> AssigneeName {
    ClientMessage::GetAssignment { key }
        .encode()
        .write_to(stream)
        .await
        .unwrap();

    match read_message(stream).await {
        ServerMessage::AssignmentUpdate { key: got, name } => {
            assert_eq!(got, key);
            name
        }
        other => panic!("expected assignment update, got {:?}", other),
    }
}

async fn set_assignment(stream: &mut TcpStream, key: SlotKey, name: &str) {
    ClientMessage::SetAssignment {
        key,
        name: AssigneeName::from(name),
    }
    .encode()
    .write_to(stream)
    .await
    .unwrap();
}

async fn read_message(stream: &mut TcpStream) -> ServerMessage {
    let frame = timeout(Duration::from_secs(2), Frame::read_from(stream))
        .await
        .expect("timed out waiting for a server message")
        .unwrap()
        .expect("server closed the connection");
    ServerMessage::decode(&frame).unwrap()
}

/// Asserts that no frame arrives on `stream` within a short window.
async fn expect_silence(stream: &mut TcpStream) {
    let got = timeout(Duration::from_millis(200), Frame::read_from(stream)).await;
    assert!(got.is_err(), "unexpected data: {:?}", got);
}

/// PROTOCOL AND ROSTER TESTS
mod protocol_tests {
    use super::*;

    /// The end-to-end scenario: login, read an empty slot, write it, and
    /// observe the push on a second connection but not on the writer.
    #[tokio::test]
    async fn end_to_end_schedule_update() {
        let server = start_server().await;
        let key = SlotKey::new(DutyKind::StableIn, 2, 2024);

        let mut writer = TcpStream::connect(server.addr).await.unwrap();
        let mut observer = TcpStream::connect(server.addr).await.unwrap();

        assert!(login(&mut writer, b"washington").await);
        // Round-trip so the observer is registered before the write.
        assert!(get_assignment(&mut observer, key).await.is_empty());

        assert!(get_assignment(&mut writer, key).await.is_empty());

        set_assignment(&mut writer, key, "Bob").await;

        match read_message(&mut observer).await {
            ServerMessage::AssignmentUpdate { key: got, name } => {
                assert_eq!(got, key);
                assert_eq!(name, AssigneeName::from("Bob"));
            }
            other => panic!("expected pushed update, got {:?}", other),
        }

        // The writer gets no echo of its own update: its next frame is
        // the reply to a get on a different slot, then nothing.
        let other_key = SlotKey::new(DutyKind::Pasture, 3, 2024);
        assert!(get_assignment(&mut writer, other_key).await.is_empty());
        expect_silence(&mut writer).await;
    }

    #[tokio::test]
    async fn wrong_credential_cannot_write() {
        let server = start_server().await;
        let key = SlotKey::new(DutyKind::StableOut, 9, 2024);

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        assert!(!login(&mut client, b"adams").await);

        set_assignment(&mut client, key, "Mallory").await;
        assert!(get_assignment(&mut client, key).await.is_empty());
    }

    /// Unauthenticated writes leave the roster untouched and produce no
    /// broadcast, however often they are retried.
    #[tokio::test]
    async fn unauthenticated_set_is_invisible() {
        let server = start_server().await;
        let key = SlotKey::new(DutyKind::Pasture, 14, 2024);

        let mut observer = TcpStream::connect(server.addr).await.unwrap();
        assert!(get_assignment(&mut observer, key).await.is_empty());

        let mut intruder = TcpStream::connect(server.addr).await.unwrap();
        for _ in 0..3 {
            set_assignment(&mut intruder, key, "Mallory").await;
        }
        // Round-trip to confirm all three writes were dispatched.
        assert!(get_assignment(&mut intruder, key).await.is_empty());

        expect_silence(&mut observer).await;
    }

    #[tokio::test]
    async fn malformed_frames_do_not_close_the_connection() {
        let server = start_server().await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        Frame::new(42, vec![0; 4]).write_to(&mut client).await.unwrap();
        Frame::new(shared::tag::GET_ASSIGNMENT, vec![0; 3])
            .write_to(&mut client)
            .await
            .unwrap();

        assert!(login(&mut client, b"washington").await);
    }

    #[tokio::test]
    async fn set_overwrites_previous_assignee() {
        let server = start_server().await;
        let key = SlotKey::new(DutyKind::StableIn, 30, 2025);

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        assert!(login(&mut client, b"washington").await);

        set_assignment(&mut client, key, "Alice").await;
        assert_eq!(
            get_assignment(&mut client, key).await,
            AssigneeName::from("Alice")
        );

        set_assignment(&mut client, key, "Bob").await;
        assert_eq!(
            get_assignment(&mut client, key).await,
            AssigneeName::from("Bob")
        );
    }
}

/// BROADCAST TESTS
mod broadcast_tests {
    use super::*;

    /// One write fans out to every other client exactly once.
    #[tokio::test]
    async fn broadcast_reaches_all_other_clients_once() {
        let server = start_server().await;
        let key = SlotKey::new(DutyKind::Pasture, 21, 2024);

        let mut a = TcpStream::connect(server.addr).await.unwrap();
        let mut b = TcpStream::connect(server.addr).await.unwrap();
        let mut c = TcpStream::connect(server.addr).await.unwrap();

        assert!(login(&mut a, b"washington").await);
        assert!(get_assignment(&mut b, key).await.is_empty());
        assert!(get_assignment(&mut c, key).await.is_empty());

        set_assignment(&mut a, key, "Alice").await;

        for observer in [&mut b, &mut c] {
            match read_message(observer).await {
                ServerMessage::AssignmentUpdate { key: got, name } => {
                    assert_eq!(got, key);
                    assert_eq!(name, AssigneeName::from("Alice"));
                }
                other => panic!("expected pushed update, got {:?}", other),
            }
            // Exactly one: nothing further arrives.
            expect_silence(observer).await;
        }
    }

    /// Two concurrent writers on the same slot: the roster converges to
    /// one of the two values and observers see both updates.
    #[tokio::test]
    async fn concurrent_writers_converge() {
        let server = start_server().await;
        let key = SlotKey::new(DutyKind::StableOut, 5, 2024);

        let mut w1 = TcpStream::connect(server.addr).await.unwrap();
        let mut w2 = TcpStream::connect(server.addr).await.unwrap();
        let mut observer = TcpStream::connect(server.addr).await.unwrap();

        assert!(login(&mut w1, b"washington").await);
        assert!(login(&mut w2, b"washington").await);
        assert!(get_assignment(&mut observer, key).await.is_empty());

        set_assignment(&mut w1, key, "X").await;
        set_assignment(&mut w2, key, "Y").await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            match read_message(&mut observer).await {
                ServerMessage::AssignmentUpdate { key: got, name } => {
                    assert_eq!(got, key);
                    seen.push(name);
                }
                other => panic!("expected pushed update, got {:?}", other),
            }
        }
        seen.sort_by_key(|name| name.code_units().to_vec());
        assert_eq!(seen, vec![AssigneeName::from("X"), AssigneeName::from("Y")]);

        // Both writes have completed, so the slot now holds exactly one
        // of the two values.
        let value = get_assignment(&mut observer, key).await;
        assert!(
            value == AssigneeName::from("X") || value == AssigneeName::from("Y"),
            "slot held a mixed value: {}",
            value
        );
    }
}

/// LIFECYCLE AND SHUTDOWN TESTS
mod lifecycle_tests {
    use super::*;

    /// A disconnecting client is removed from the registry exactly once.
    #[tokio::test]
    async fn disconnect_removes_registry_entry() {
        let server = start_server().await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        assert!(login(&mut client, b"washington").await);
        assert_eq!(server.registry.len().await, 1);

        drop(client);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while server.registry.len().await > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker did not remove its registry entry"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// One client dropping never disturbs the others.
    #[tokio::test]
    async fn disconnect_is_local_to_the_connection() {
        let server = start_server().await;
        let key = SlotKey::new(DutyKind::Pasture, 1, 2026);

        let mut staying = TcpStream::connect(server.addr).await.unwrap();
        let leaving = TcpStream::connect(server.addr).await.unwrap();

        assert!(login(&mut staying, b"washington").await);
        drop(leaving);

        // The surviving connection still works.
        set_assignment(&mut staying, key, "Carol").await;
        assert_eq!(
            get_assignment(&mut staying, key).await,
            AssigneeName::from("Carol")
        );
    }

    /// Shutdown closes every live connection and returns only once the
    /// registry has drained.
    #[tokio::test]
    async fn graceful_shutdown_drains_all_clients() {
        let server = start_server().await;

        let mut c1 = TcpStream::connect(server.addr).await.unwrap();
        let mut c2 = TcpStream::connect(server.addr).await.unwrap();
        assert!(login(&mut c1, b"washington").await);
        assert!(!login(&mut c2, b"hamilton").await);
        assert_eq!(server.registry.len().await, 2);

        server.shutdown.send(true).unwrap();

        let result = timeout(Duration::from_secs(2), server.handle)
            .await
            .expect("server did not drain in time")
            .unwrap();
        assert!(result.is_ok(), "shutdown was not clean: {:?}", result);
        assert_eq!(server.registry.len().await, 0);

        // Both clients observe their sockets closing.
        for client in [&mut c1, &mut c2] {
            let eof = timeout(Duration::from_secs(1), Frame::read_from(client))
                .await
                .expect("no EOF after shutdown")
                .unwrap();
            assert!(eof.is_none());
        }
    }

    /// New connections are refused once the listener is gone.
    #[tokio::test]
    async fn no_accepts_after_shutdown() {
        let server = start_server().await;

        server.shutdown.send(true).unwrap();
        timeout(Duration::from_secs(2), server.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();

        let connect = TcpStream::connect(server.addr).await;
        assert!(connect.is_err(), "listener still accepting after shutdown");
    }
}
