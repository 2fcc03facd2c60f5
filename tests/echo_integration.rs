use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use emberdb::config::ServerConfig;
use emberdb::protocol::{EchoProtocol, Protocol, ProtocolFactory, ECHO_PACKET_TYPE};
use emberdb::server::{Server, ServerError, ServerHandle};

fn start_server(
    num_workers: usize,
    max_connections: usize,
) -> (ServerHandle, SocketAddr, JoinHandle<Result<(), ServerError>>) {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        num_workers,
        max_connections,
        ..ServerConfig::default()
    };
    let factory: ProtocolFactory = Arc::new(|| Box::new(EchoProtocol::new()) as Box<dyn Protocol>);
    let server = Server::bind(config, factory).unwrap();
    let addr = server.local_addr();
    let handle = server.handle();
    let join = std::thread::spawn(move || server.serve());
    (handle, addr, join)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client
}

/// Read one `[type][len][payload]` packet off the wire.
fn read_packet(client: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 5];
    client.read_exact(&mut head).unwrap();
    let len = u32::from_be_bytes(head[1..5].try_into().unwrap()) as usize;
    assert!(len >= 4, "length field must cover itself");
    let mut body = vec![0u8; len - 4];
    client.read_exact(&mut body).unwrap();
    (head[0], body)
}

/// Send `payload` and collect the echoed bytes back, across however many
/// packets the server framed them into.
fn echo_roundtrip(client: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    client.write_all(payload).unwrap();
    let mut got = Vec::new();
    while got.len() < payload.len() {
        let (ty, body) = read_packet(client);
        assert_eq!(ty, ECHO_PACKET_TYPE);
        got.extend_from_slice(&body);
    }
    got
}

#[test]
fn test_single_client_echo() {
    let (handle, addr, join) = start_server(2, 100);

    let mut client = connect(addr);
    let got = echo_roundtrip(&mut client, b"hello");
    assert_eq!(got, b"hello");

    drop(client);
    handle.shutdown();
    assert!(join.join().unwrap().is_ok());
}

#[test]
fn test_four_clients_across_two_workers() {
    let (handle, addr, join) = start_server(2, 100);

    let mut clients: Vec<TcpStream> = (0..4).map(|_| connect(addr)).collect();
    for (i, client) in clients.iter_mut().enumerate() {
        let payload = vec![b'a' + i as u8; 32];
        assert_eq!(echo_roundtrip(client, &payload), payload);
    }
    // A second round on the same sockets, out of accept order.
    for (i, client) in clients.iter_mut().enumerate().rev() {
        let payload = vec![b'A' + i as u8; 16];
        assert_eq!(echo_roundtrip(client, &payload), payload);
    }

    drop(clients);
    handle.shutdown();
    assert!(join.join().unwrap().is_ok());
}

#[test]
fn test_concurrent_clients() {
    let (handle, addr, join) = start_server(4, 100);

    let mut threads = Vec::new();
    for t in 0..8u8 {
        threads.push(std::thread::spawn(move || {
            let mut client = connect(addr);
            for round in 0..20usize {
                let payload = vec![t; 1 + (round * 97) % 3000];
                assert_eq!(echo_roundtrip(&mut client, &payload), payload);
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    handle.shutdown();
    assert!(join.join().unwrap().is_ok());
}

#[test]
fn test_large_transfer_survives_buffer_pressure() {
    let (handle, addr, join) = start_server(1, 100);

    let mut client = connect(addr);
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();

    // The full burst is written before anything is read back, so the
    // server's write side is guaranteed to hit a full socket and resume
    // from write-readiness.
    let got = echo_roundtrip(&mut client, &payload);
    assert_eq!(got, payload);

    drop(client);
    handle.shutdown();
    assert!(join.join().unwrap().is_ok());
}

#[test]
fn test_abrupt_disconnect_leaves_others_untouched() {
    let (handle, addr, join) = start_server(1, 100);

    let mut steady = connect(addr);
    assert_eq!(echo_roundtrip(&mut steady, b"before"), b"before");

    // A second connection on the same worker vanishes mid-session.
    let mut doomed = connect(addr);
    doomed.write_all(b"going away").unwrap();
    drop(doomed);

    // The survivor keeps echoing.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(echo_roundtrip(&mut steady, b"after"), b"after");

    drop(steady);
    handle.shutdown();
    assert!(join.join().unwrap().is_ok());
}

#[test]
fn test_sequential_sessions_recycle_slots() {
    let (handle, addr, join) = start_server(1, 100);

    // Closed fds get recycled by the OS almost immediately, so sequential
    // sessions repeatedly exercise the reuse path of the connection table.
    for round in 0..20u8 {
        let mut client = connect(addr);
        let payload = vec![round; 64];
        assert_eq!(echo_roundtrip(&mut client, &payload), payload);
        drop(client);
        std::thread::sleep(Duration::from_millis(10));
    }

    handle.shutdown();
    assert!(join.join().unwrap().is_ok());
}

#[test]
fn test_max_connections_closes_excess() {
    let (handle, addr, join) = start_server(1, 2);

    let mut first = connect(addr);
    let mut second = connect(addr);
    assert_eq!(echo_roundtrip(&mut first, b"one"), b"one");
    assert_eq!(echo_roundtrip(&mut second, b"two"), b"two");

    // Both slots are taken; the next accept is closed on the spot.
    let mut excess = connect(addr);
    let mut probe = [0u8; 1];
    match excess.read(&mut probe) {
        Ok(0) | Err(_) => {}
        Ok(_) => panic!("excess connection should have been closed"),
    }

    // The established sessions are unaffected.
    assert_eq!(echo_roundtrip(&mut first, b"still"), b"still");

    drop(first);
    drop(second);
    handle.shutdown();
    assert!(join.join().unwrap().is_ok());
}

#[test]
fn test_graceful_shutdown_closes_live_connections() {
    let (handle, addr, join) = start_server(4, 100);

    let mut clients: Vec<TcpStream> = (0..6).map(|_| connect(addr)).collect();
    for client in clients.iter_mut() {
        assert_eq!(echo_roundtrip(client, b"live"), b"live");
    }

    handle.shutdown();
    assert!(join.join().unwrap().is_ok());

    // Every worker closed its connections on the way out.
    for client in clients.iter_mut() {
        let mut probe = [0u8; 1];
        match client.read(&mut probe) {
            Ok(0) | Err(_) => {}
            Ok(_) => panic!("connection should be closed after shutdown"),
        }
    }
}
