//! Integration tests: the relay's wire protocol over real TCP.
//!
//! Each test launches a server, connects via std TCP, speaks 515-byte
//! records, and verifies the frames that come back. Requires a kernel
//! with io_uring multishot accept/recv and provided buffers.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use chatring::{Config, ServerBuilder, ShutdownHandle};
use protocol_chat::{FRAME_LEN, HEADER_LEN};

const ACK: u8 = 0x01;
const CHAT: u8 = 0x03;
const NOTIFICATION: u8 = 0x04;
const CLIENT_JOIN: u8 = 0x11;
const CLIENT_LEAVE: u8 = 0x12;
const CLIENT_CHAT: u8 = 0x13;

// ── Helpers ─────────────────────────────────────────────────────────

fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.host = "127.0.0.1".parse().unwrap();
    config.port = port;
    config.shards = 2;
    config.buffers_per_shard = 64;
    config.buffer_size = 1024;
    config.submission_queue_depth = 2048;
    config.send_copy_count = 64;
    config.pin_to_core = false;
    config
}

/// Find an available port by binding to :0.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_for_server(addr: &str) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr) {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            return stream;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start on {addr}");
}

fn launch_with(
    config: Config,
) -> (ShutdownHandle, Vec<std::thread::JoinHandle<Result<(), chatring::Error>>>) {
    ServerBuilder::new(config).launch().expect("launch failed")
}

fn launch(port: u16) -> (ShutdownHandle, Vec<std::thread::JoinHandle<Result<(), chatring::Error>>>) {
    launch_with(test_config(port))
}

fn record(tag: u8, payload: &[u8]) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[0] = tag;
    buf[1..3].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    buf
}

fn send_record(stream: &mut TcpStream, tag: u8, payload: &[u8]) {
    stream.write_all(&record(tag, payload)).unwrap();
    stream.flush().unwrap();
}

fn read_record(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut buf = [0u8; FRAME_LEN];
    stream.read_exact(&mut buf).unwrap();
    let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    (buf[0], buf[HEADER_LEN..HEADER_LEN + len].to_vec())
}

/// Assert that no bytes arrive within a short window.
fn expect_silence(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => panic!("connection closed while expecting silence"),
        Ok(_) => panic!("unexpected frame while expecting silence"),
        Err(e) => assert!(
            matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            "unexpected read error: {e}"
        ),
    }
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
}

fn join_payload(session_id: i32) -> [u8; 4] {
    session_id.to_le_bytes()
}

fn shutdown_and_join(
    shutdown: ShutdownHandle,
    handles: Vec<std::thread::JoinHandle<Result<(), chatring::Error>>>,
) {
    shutdown.shutdown();
    for h in handles {
        h.join().unwrap().unwrap();
    }
}

/// Connect A (auto-assigned session 0) and B, and move B into session 0.
/// Returns both streams with B's ACK and A's join notification consumed.
fn connect_pair(addr: &str) -> (TcpStream, TcpStream) {
    let mut a = wait_for_server(addr);
    // First client lands in session 0; confirm via an idempotent JOIN.
    send_record(&mut a, CLIENT_JOIN, &join_payload(0));
    let (tag, payload) = read_record(&mut a);
    assert_eq!(tag, ACK);
    assert_eq!(payload, b"joined session:0");

    let mut b = TcpStream::connect(addr).unwrap();
    b.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    send_record(&mut b, CLIENT_JOIN, &join_payload(0));
    let (tag, payload) = read_record(&mut b);
    assert_eq!(tag, ACK);
    assert_eq!(payload, b"joined session:0");

    // A hears about B joining.
    let (tag, payload) = read_record(&mut a);
    assert_eq!(tag, NOTIFICATION);
    assert_eq!(payload, b"joined session:0");

    (a, b)
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn join_acks_and_solo_chat_is_dropped() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let mut a = wait_for_server(&addr);
    send_record(&mut a, CLIENT_JOIN, &join_payload(0));
    let (tag, payload) = read_record(&mut a);
    assert_eq!(tag, ACK);
    assert_eq!(payload, b"joined session:0");

    // One member in the session: the frame is dropped, nothing comes back.
    send_record(&mut a, CLIENT_CHAT, b"hi");
    expect_silence(&mut a);

    shutdown_and_join(shutdown, handles);
}

#[test]
fn two_client_broadcast_excludes_sender() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let (mut a, mut b) = connect_pair(&addr);

    send_record(&mut a, CLIENT_CHAT, b"hi");
    let (tag, payload) = read_record(&mut b);
    assert_eq!(tag, CHAT);
    assert_eq!(payload, b"hi");

    // Echo to the sender is disabled by default.
    expect_silence(&mut a);

    shutdown_and_join(shutdown, handles);
}

#[test]
fn chat_payload_is_sanitized() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let (mut a, mut b) = connect_pair(&addr);

    send_record(&mut a, CLIENT_CHAT, b"a\x01b\x02c");
    let (tag, payload) = read_record(&mut b);
    assert_eq!(tag, CHAT);
    assert_eq!(payload, b"abc");

    shutdown_and_join(shutdown, handles);
}

#[test]
fn chat_that_sanitizes_to_empty_is_dropped() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let (mut a, mut b) = connect_pair(&addr);

    send_record(&mut a, CLIENT_CHAT, b"\x01\x02\x03");
    expect_silence(&mut b);

    shutdown_and_join(shutdown, handles);
}

#[test]
fn malformed_tag_keeps_connection_open() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let mut a = wait_for_server(&addr);
    // Tag 0x00 is malformed: the frame is dropped with no reply.
    send_record(&mut a, 0x00, b"junk");
    expect_silence(&mut a);

    // The connection is still usable.
    send_record(&mut a, CLIENT_JOIN, &join_payload(0));
    let (tag, payload) = read_record(&mut a);
    assert_eq!(tag, ACK);
    assert_eq!(payload, b"joined session:0");

    shutdown_and_join(shutdown, handles);
}

#[test]
fn echo_to_sender_when_configured() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let mut config = test_config(port);
    config.broadcast_echo_sender = true;
    let (shutdown, handles) = launch_with(config);

    let (mut a, mut b) = connect_pair(&addr);

    send_record(&mut a, CLIENT_CHAT, b"hello");
    let (tag, payload) = read_record(&mut b);
    assert_eq!(tag, CHAT);
    assert_eq!(payload, b"hello");

    // With echo enabled the sender receives its own copy.
    let (tag, payload) = read_record(&mut a);
    assert_eq!(tag, CHAT);
    assert_eq!(payload, b"hello");

    shutdown_and_join(shutdown, handles);
}

#[test]
fn join_with_short_payload_returns_error() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let mut a = wait_for_server(&addr);
    send_record(&mut a, CLIENT_JOIN, &[1, 2]);
    let (tag, payload) = read_record(&mut a);
    assert_eq!(tag, 0x02);
    assert_eq!(payload, b"invalid join payload");

    shutdown_and_join(shutdown, handles);
}

#[test]
fn reserved_command_frame_is_dropped_silently() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let mut a = wait_for_server(&addr);
    send_record(&mut a, 0x14, b"whisper");
    expect_silence(&mut a);

    // The connection is still usable afterwards.
    send_record(&mut a, CLIENT_JOIN, &join_payload(0));
    let (tag, _) = read_record(&mut a);
    assert_eq!(tag, ACK);

    shutdown_and_join(shutdown, handles);
}

#[test]
fn join_unknown_session_returns_error() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let mut a = wait_for_server(&addr);
    send_record(&mut a, CLIENT_JOIN, &join_payload(99));
    let (tag, payload) = read_record(&mut a);
    assert_eq!(tag, 0x02);
    assert_eq!(payload, b"unknown session 99");

    shutdown_and_join(shutdown, handles);
}

#[test]
fn frames_straddling_receives_are_reassembled() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let (mut a, mut b) = connect_pair(&addr);

    // Deliver one CHAT record in two writes with a pause, so the
    // server sees a partial record first.
    let rec = record(CLIENT_CHAT, b"split");
    a.write_all(&rec[..200]).unwrap();
    a.flush().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    a.write_all(&rec[200..]).unwrap();
    a.flush().unwrap();

    let (tag, payload) = read_record(&mut b);
    assert_eq!(tag, CHAT);
    assert_eq!(payload, b"split");

    shutdown_and_join(shutdown, handles);
}

#[test]
fn two_records_in_one_write_both_broadcast() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let (mut a, mut b) = connect_pair(&addr);

    let mut batch = Vec::with_capacity(FRAME_LEN * 2);
    batch.extend_from_slice(&record(CLIENT_CHAT, b"one"));
    batch.extend_from_slice(&record(CLIENT_CHAT, b"two"));
    a.write_all(&batch).unwrap();
    a.flush().unwrap();

    let (tag, payload) = read_record(&mut b);
    assert_eq!(tag, CHAT);
    assert_eq!(payload, b"one");
    let (tag, payload) = read_record(&mut b);
    assert_eq!(tag, CHAT);
    assert_eq!(payload, b"two");

    shutdown_and_join(shutdown, handles);
}

#[test]
fn leave_closes_the_connection_and_notifies() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let (mut a, mut b) = connect_pair(&addr);

    send_record(&mut b, CLIENT_LEAVE, b"");
    let (tag, _payload) = read_record(&mut a);
    assert_eq!(tag, NOTIFICATION);

    // B's connection ends after LEAVE.
    let mut byte = [0u8; 1];
    match b.read(&mut byte) {
        Ok(0) => {}
        Ok(_) => panic!("unexpected data after LEAVE"),
        Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset, "read error: {e}"),
    }

    shutdown_and_join(shutdown, handles);
}

#[test]
fn disconnect_notifies_remaining_members() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let (mut a, b) = connect_pair(&addr);
    drop(b);

    let (tag, payload) = read_record(&mut a);
    assert_eq!(tag, NOTIFICATION);
    assert!(payload.ends_with(b"disconnected"));

    shutdown_and_join(shutdown, handles);
}

#[test]
fn shutdown_drains_with_connected_clients() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = launch(port);

    let mut clients = Vec::new();
    for _ in 0..16 {
        clients.push(wait_for_server(&addr));
    }
    std::thread::sleep(Duration::from_millis(100));

    // Every shard must exit cleanly with clients still connected.
    shutdown_and_join(shutdown, handles);

    // Connected sockets observe EOF or reset once the server is gone.
    for mut client in clients {
        let mut byte = [0u8; 1];
        match client.read(&mut byte) {
            Ok(0) | Err(_) => {}
            Ok(_) => panic!("unexpected data during shutdown"),
        }
    }
}
