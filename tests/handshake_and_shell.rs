//! End-to-end tests driving `Connection::connect` and the sub-protocols
//! against a fake adbd speaking the real wire format over a loopback TCP
//! socket (the concrete transport `Connection::connect` accepts).

use adb_core::codec::{Command, Packet, PacketCodec};
use adb_core::{ConnectConfig, Connection, KeySigner, Service, ServiceRequest, Shell, Sync};
use byteorder::{ByteOrder, LittleEndian};
use futures::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

type DevicePeer = Framed<TcpStream, PacketCodec>;

async fn device_recv(peer: &mut DevicePeer) -> Packet {
    peer.next().await.unwrap().unwrap()
}

async fn device_send(peer: &mut DevicePeer, packet: Packet) {
    peer.send(packet).await.unwrap();
}

/// Reads a SYNC `STAT`/`RECV`-style request (8-byte id+arg frame followed by
/// `arg` bytes of path) off the wire. `Stream::write` without delayed_ack
/// acks each call separately, so the id+arg frame and the path bytes arrive
/// as two distinct WRTE packets, each needing its own `OKAY`.
async fn device_read_name_request(peer: &mut DevicePeer, remote_id: u32, local_id: u32) -> String {
    let header = device_recv(peer).await;
    assert_eq!(header.command.as_u32(), Command::Wrte.as_u32());
    let name_len = LittleEndian::read_u32(&header.payload[4..8]) as usize;
    device_send(peer, Packet::empty(Command::Okay, remote_id, local_id)).await;

    let name_pkt = device_recv(peer).await;
    assert_eq!(name_pkt.command.as_u32(), Command::Wrte.as_u32());
    let name = String::from_utf8_lossy(&name_pkt.payload[..name_len]).into_owned();
    device_send(peer, Packet::empty(Command::Okay, remote_id, local_id)).await;
    name
}

fn device_cnxn_banner() -> Vec<u8> {
    b"device::ro.product.name=testdevice;features=shell_v2,cmd,stat_v2,abb_exec\0".to_vec()
}

async fn connect_client(addr: std::net::SocketAddr) -> (Connection, KeySigner) {
    let signer = KeySigner::generate(&mut OsRng).unwrap();
    let transport = adb_core::transport::connect_tcp(&addr.to_string()).await.unwrap();
    let config = ConnectConfig::default();
    let connection = Connection::connect(transport, &signer, config, "host::adb_core-tests")
        .await
        .unwrap();
    (connection, signer)
}

/// Scenario 1: the device authorizes the connection with no AUTH round at
/// all, replying `CNXN` directly to the client's `CNXN`.
#[tokio::test]
async fn handshake_succeeds_with_pre_authorized_peer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let device_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut peer = Framed::new(socket, PacketCodec::new(1 << 20));
        let cnxn = device_recv(&mut peer).await;
        assert_eq!(cnxn.command.as_u32(), Command::Cnxn.as_u32());
        device_send(&mut peer, Packet::new(Command::Cnxn, 0x0100_0001, 1 << 20, device_cnxn_banner())).await;
        peer
    });

    let (connection, _signer) = connect_client(local_addr).await;

    assert!(connection.supports("shell_v2"));
    assert!(connection.supports("cmd"));
    assert!(!connection.supports("nonexistent_feature"));
    device_task.await.unwrap();
}

/// Scenario 2: the device challenges with a token, accepts the signature
/// on the first round, then issues `CNXN`.
#[tokio::test]
async fn handshake_succeeds_after_one_signature_round() {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let device_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut peer = Framed::new(socket, PacketCodec::new(1 << 20));
        let _cnxn = device_recv(&mut peer).await;

        let token = [0xABu8; 20];
        device_send(&mut peer, Packet::new(Command::Auth, 1, 0, token.to_vec())).await;

        let sig = device_recv(&mut peer).await;
        assert_eq!(sig.command.as_u32(), Command::Auth.as_u32());
        assert_eq!(sig.arg0, 2);
        assert_eq!(sig.payload.len(), 256);

        device_send(&mut peer, Packet::new(Command::Cnxn, 0x0100_0001, 1 << 20, device_cnxn_banner())).await;
    });

    let (connection, _signer) = connect_client(local_addr).await;
    assert!(connection.supports("shell_v2"));
    device_task.await.unwrap();
}

/// Scenario 2b: the device rejects the signature, so the client offers
/// its public key on the second `AUTH(TOKEN)` round.
#[tokio::test]
async fn handshake_falls_back_to_public_key_on_second_token_round() {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let device_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut peer = Framed::new(socket, PacketCodec::new(1 << 20));
        let _cnxn = device_recv(&mut peer).await;

        device_send(&mut peer, Packet::new(Command::Auth, 1, 0, [0x01u8; 20].to_vec())).await;
        let _sig = device_recv(&mut peer).await;

        device_send(&mut peer, Packet::new(Command::Auth, 1, 0, [0x02u8; 20].to_vec())).await;
        let key = device_recv(&mut peer).await;
        assert_eq!(key.arg0, 3);
        let text = String::from_utf8(key.payload).unwrap();
        assert!(text.ends_with('\0'));
        assert!(text.contains("host::adb_core-tests"));

        device_send(&mut peer, Packet::new(Command::Cnxn, 0x0100_0001, 1 << 20, device_cnxn_banner())).await;
    });

    let (connection, _signer) = connect_client(local_addr).await;
    assert!(connection.supports("cmd"));
    device_task.await.unwrap();
}

/// Scenario 3: shell v2 echo with distinct stdout/stderr and a non-zero
/// exit code.
#[tokio::test]
async fn shell_v2_exec_separates_stdout_stderr_and_exit_code() {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let device_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut peer = Framed::new(socket, PacketCodec::new(1 << 20));
        let _cnxn = device_recv(&mut peer).await;
        device_send(&mut peer, Packet::new(Command::Cnxn, 0x0100_0001, 1 << 20, device_cnxn_banner())).await;

        let open = device_recv(&mut peer).await;
        assert_eq!(open.command.as_u32(), Command::Open.as_u32());
        let dest = String::from_utf8_lossy(&open.payload).into_owned();
        assert_eq!(dest.trim_end_matches('\0'), "shell,v2,raw:printf abc; printf def 1>&2; exit 7");
        let local_id = open.arg0;
        let remote_id = 100u32;
        device_send(&mut peer, Packet::empty(Command::Okay, remote_id, local_id)).await;

        let stdout_frame = shell_frame(1, b"abc");
        device_send(&mut peer, Packet::new(Command::Wrte, remote_id, local_id, stdout_frame)).await;
        let ack = device_recv(&mut peer).await;
        assert_eq!(ack.command.as_u32(), Command::Okay.as_u32());

        let stderr_frame = shell_frame(2, b"def");
        device_send(&mut peer, Packet::new(Command::Wrte, remote_id, local_id, stderr_frame)).await;
        let ack = device_recv(&mut peer).await;
        assert_eq!(ack.command.as_u32(), Command::Okay.as_u32());

        let exit_frame = shell_frame(3, &[7u8]);
        device_send(&mut peer, Packet::new(Command::Wrte, remote_id, local_id, exit_frame)).await;
        let ack = device_recv(&mut peer).await;
        assert_eq!(ack.command.as_u32(), Command::Okay.as_u32());

        device_send(&mut peer, Packet::empty(Command::Clse, remote_id, local_id)).await;
    });

    let (connection, _signer) = connect_client(local_addr).await;
    let result = Shell::exec(&connection, "printf abc; printf def 1>&2; exit 7").await.unwrap();
    assert_eq!(result.stdout, b"abc");
    assert_eq!(result.stderr, b"def");
    assert_eq!(result.exit_code, Some(7));

    device_task.await.unwrap();
}

fn shell_frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(id);
    let mut len_buf = [0u8; 4];
    LittleEndian::write_u32(&mut len_buf, payload.len() as u32);
    out.extend_from_slice(&len_buf);
    out.extend_from_slice(payload);
    out
}

/// Scenario 5: SYNC SEND followed by RECV of a non-trivial byte pattern
/// round-trips exactly, with mode and mtime carried correctly.
#[tokio::test]
async fn sync_send_then_recv_round_trips_a_large_payload() {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let payload_for_device = payload.clone();

    let device_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut peer = Framed::new(socket, PacketCodec::new(1 << 20));
        let _cnxn = device_recv(&mut peer).await;
        device_send(&mut peer, Packet::new(Command::Cnxn, 0x0100_0001, 1 << 20, device_cnxn_banner())).await;

        let open = device_recv(&mut peer).await;
        let local_id = open.arg0;
        let remote_id = 7u32;
        device_send(&mut peer, Packet::empty(Command::Okay, remote_id, local_id)).await;

        // Drain the whole SEND session, reconstructing the sync byte stream
        // out of however many WRTE packets it arrived in.
        let mut inbound = Vec::new();
        let mut stored: Option<(Vec<u8>, u32, u32)> = None;
        loop {
            let pkt = device_recv(&mut peer).await;
            match pkt.command.as_u32() {
                c if c == Command::Wrte.as_u32() => {
                    inbound.extend_from_slice(&pkt.payload);
                    device_send(&mut peer, Packet::empty(Command::Okay, remote_id, local_id)).await;
                    if let Some(parsed) = try_parse_send_session(&inbound) {
                        stored = Some(parsed);
                        break;
                    }
                }
                other => panic!("unexpected command {other:#x} while draining SEND"),
            }
        }
        let (data, mode, _mtime) = stored.unwrap();
        assert_eq!(data, payload_for_device);
        assert_eq!(mode, 0o644);

        let mut okay = [0u8; 8];
        okay[0..4].copy_from_slice(b"OKAY");
        device_send(&mut peer, Packet::new(Command::Wrte, remote_id, local_id, okay.to_vec())).await;
        let _ack = device_recv(&mut peer).await;

        // RECV: read the request, then stream the same data back in DATA chunks.
        let name = device_read_name_request(&mut peer, remote_id, local_id).await;
        assert_eq!(name, "/data/local/tmp/t.bin");

        for chunk in data.chunks(64 * 1024) {
            let mut frame = Vec::new();
            frame.extend_from_slice(b"DATA");
            let mut len_buf = [0u8; 4];
            LittleEndian::write_u32(&mut len_buf, chunk.len() as u32);
            frame.extend_from_slice(&len_buf);
            frame.extend_from_slice(chunk);
            device_send(&mut peer, Packet::new(Command::Wrte, remote_id, local_id, frame)).await;
            let _ack = device_recv(&mut peer).await;
        }
        let mut done = Vec::new();
        done.extend_from_slice(b"DONE");
        done.extend_from_slice(&0u32.to_le_bytes());
        device_send(&mut peer, Packet::new(Command::Wrte, remote_id, local_id, done)).await;
        let _ack = device_recv(&mut peer).await;

        device_send(&mut peer, Packet::empty(Command::Clse, remote_id, local_id)).await;
    });

    let (connection, _signer) = connect_client(local_addr).await;
    let mut sync = Sync::open(&connection).await.unwrap();
    sync.send("/data/local/tmp/t.bin", 0o644, 1_700_000_000, &payload).await.unwrap();
    let received = sync.recv("/data/local/tmp/t.bin").await.unwrap();
    assert_eq!(received, payload);

    device_task.await.unwrap();
}

/// `Sync::send_file` streams straight off disk instead of staging the
/// whole transfer into a `Vec<u8>` first; confirm it reaches the device
/// chunked the same way `Sync::send` does.
#[tokio::test]
async fn sync_send_file_streams_from_a_local_path() {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 199) as u8).collect();
    let dir = tempfile::tempdir().unwrap();
    let local_path = dir.path().join("upload.bin");
    tokio::fs::write(&local_path, &payload).await.unwrap();
    let payload_for_device = payload.clone();

    let device_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut peer = Framed::new(socket, PacketCodec::new(1 << 20));
        let _cnxn = device_recv(&mut peer).await;
        device_send(&mut peer, Packet::new(Command::Cnxn, 0x0100_0001, 1 << 20, device_cnxn_banner())).await;

        let open = device_recv(&mut peer).await;
        let local_id = open.arg0;
        let remote_id = 9u32;
        device_send(&mut peer, Packet::empty(Command::Okay, remote_id, local_id)).await;

        let mut inbound = Vec::new();
        let parsed = loop {
            let pkt = device_recv(&mut peer).await;
            assert_eq!(pkt.command.as_u32(), Command::Wrte.as_u32());
            inbound.extend_from_slice(&pkt.payload);
            device_send(&mut peer, Packet::empty(Command::Okay, remote_id, local_id)).await;
            if let Some(parsed) = try_parse_send_session(&inbound) {
                break parsed;
            }
        };
        let (data, mode, mtime) = parsed;
        assert_eq!(data, payload_for_device);
        assert_eq!(mode, 0o600);
        assert_eq!(mtime, 1_650_000_000);

        let mut okay = Vec::new();
        okay.extend_from_slice(b"OKAY");
        okay.extend_from_slice(&0u32.to_le_bytes());
        device_send(&mut peer, Packet::new(Command::Wrte, remote_id, local_id, okay)).await;
        let _ack = device_recv(&mut peer).await;
        device_send(&mut peer, Packet::empty(Command::Clse, remote_id, local_id)).await;
    });

    let (connection, _signer) = connect_client(local_addr).await;
    let mut sync = Sync::open(&connection).await.unwrap();
    sync.send_file(&local_path, "/data/local/tmp/upload.bin", 0o600, 1_650_000_000).await.unwrap();

    device_task.await.unwrap();
}

/// `Sync::recv_to_file` writes a downloaded remote file straight to disk
/// instead of returning it as a `Vec<u8>`.
#[tokio::test]
async fn sync_recv_to_file_writes_directly_to_a_local_path() {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 97) as u8).collect();
    let payload_for_device = payload.clone();
    let dir = tempfile::tempdir().unwrap();
    let local_path = dir.path().join("downloaded.bin");

    let device_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut peer = Framed::new(socket, PacketCodec::new(1 << 20));
        let _cnxn = device_recv(&mut peer).await;
        device_send(&mut peer, Packet::new(Command::Cnxn, 0x0100_0001, 1 << 20, device_cnxn_banner())).await;

        let open = device_recv(&mut peer).await;
        let local_id = open.arg0;
        let remote_id = 11u32;
        device_send(&mut peer, Packet::empty(Command::Okay, remote_id, local_id)).await;

        let name = device_read_name_request(&mut peer, remote_id, local_id).await;
        assert_eq!(name, "/data/local/tmp/download.bin");

        for chunk in payload_for_device.chunks(64 * 1024) {
            let mut frame = Vec::new();
            frame.extend_from_slice(b"DATA");
            frame.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            frame.extend_from_slice(chunk);
            device_send(&mut peer, Packet::new(Command::Wrte, remote_id, local_id, frame)).await;
            let _ack = device_recv(&mut peer).await;
        }
        let mut done = Vec::new();
        done.extend_from_slice(b"DONE");
        done.extend_from_slice(&0u32.to_le_bytes());
        device_send(&mut peer, Packet::new(Command::Wrte, remote_id, local_id, done)).await;
        let _ack = device_recv(&mut peer).await;
        device_send(&mut peer, Packet::empty(Command::Clse, remote_id, local_id)).await;
    });

    let (connection, _signer) = connect_client(local_addr).await;
    let mut sync = Sync::open(&connection).await.unwrap();
    sync.recv_to_file("/data/local/tmp/download.bin", &local_path).await.unwrap();
    let on_disk = tokio::fs::read(&local_path).await.unwrap();
    assert_eq!(on_disk, payload);

    device_task.await.unwrap();
}

/// Best-effort reassembly of a buffered `SEND` session (info frame, any
/// number of `DATA` chunks, terminal `DONE`) purely to let the fake
/// device assert on what the client sent without hand-tracking offsets
/// across an arbitrary number of `WRTE` packets.
fn try_parse_send_session(buf: &[u8]) -> Option<(Vec<u8>, u32, u32)> {
    let mut pos = 0;
    if buf.len() < 8 || &buf[0..4] != b"SEND" {
        return None;
    }
    let info_len = LittleEndian::read_u32(&buf[4..8]) as usize;
    pos += 8;
    if buf.len() < pos + info_len {
        return None;
    }
    let info = String::from_utf8_lossy(&buf[pos..pos + info_len]).into_owned();
    pos += info_len;
    let (_path, mode_str) = info.rsplit_once(',')?;
    let mode: u32 = mode_str.parse().ok()?;

    let mut data = Vec::new();
    loop {
        if buf.len() < pos + 8 {
            return None;
        }
        let id = &buf[pos..pos + 4];
        let arg = LittleEndian::read_u32(&buf[pos + 4..pos + 8]);
        pos += 8;
        if id == b"DONE" {
            return Some((data, mode, arg));
        }
        if id != b"DATA" {
            return None;
        }
        if buf.len() < pos + arg as usize {
            return None;
        }
        data.extend_from_slice(&buf[pos..pos + arg as usize]);
        pos += arg as usize;
    }
}

/// The service opener picks `shell,v2,raw:` only once the peer has
/// advertised `shell_v2`; confirm it against a live, feature-bearing
/// connection rather than relying on the destination-string unit tests
/// alone.
#[tokio::test]
async fn service_opener_prefers_shell_v2_destination_when_supported() {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let device_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut peer = Framed::new(socket, PacketCodec::new(1 << 20));
        let _cnxn = device_recv(&mut peer).await;
        device_send(&mut peer, Packet::new(Command::Cnxn, 0x0100_0001, 1 << 20, device_cnxn_banner())).await;
        let open = device_recv(&mut peer).await;
        let dest = String::from_utf8_lossy(&open.payload).into_owned();
        assert_eq!(dest.trim_end_matches('\0'), "shell,v2,raw:id");
        device_send(&mut peer, Packet::empty(Command::Clse, 0, open.arg0)).await;
    });

    let (connection, _signer) = connect_client(local_addr).await;
    assert_eq!(Service::destination(&connection, &ServiceRequest::Shell("id")), "shell,v2,raw:id");
    match Service::open(&connection, ServiceRequest::Shell("id")).await {
        Err(adb_core::StreamError::ServiceUnavailable { .. }) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected the device's CLSE to surface as ServiceUnavailable"),
    }

    device_task.await.unwrap();
}
