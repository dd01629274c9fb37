mod common;

use common::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempdir::TempDir;
use tftp_engine::{ClientError, ErrorCode, FileMode, Packet, ServerConfig};
use tokio_test::{assert_err, assert_ok};

fn peer_error(err: ClientError) -> (ErrorCode, String) {
    match err {
        ClientError::PeerError { code, message } => (code, message),
        other => panic!("unexpected {other}"),
    }
}

#[tokio::test]
async fn test_existing_file_is_not_overwritten_by_default() {
    let tmpdir = TempDir::new("scratch").unwrap();
    std::fs::write(tmpdir.path().join("config.txt"), b"original").unwrap();
    let (_server, addr) = start_server(tmpdir.path(), quick_config());

    let err = assert_err!(quick_client(addr).upload("config.txt", &b"replacement"[..], |_| {}).await);
    assert_eq!(peer_error(err), (ErrorCode::FileAlreadyExists, "file already exists".to_string()));
    assert_eq!(std::fs::read(tmpdir.path().join("config.txt")).unwrap(), b"original");
}

#[tokio::test]
async fn test_overwrite_when_allowed() {
    let tmpdir = TempDir::new("scratch").unwrap();
    std::fs::write(tmpdir.path().join("config.txt"), patterned(2000)).unwrap();
    let config = ServerConfig { allow_overwrite: true, ..quick_config() };
    let (_server, addr) = start_server(tmpdir.path(), config);

    assert_ok!(quick_client(addr).upload("config.txt", &b"short"[..], |_| {}).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(std::fs::read(tmpdir.path().join("config.txt")).unwrap(), b"short");
}

#[tokio::test]
async fn test_read_only_server_refuses_writes() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let config = ServerConfig { allow_writes: false, ..quick_config() };
    let (_server, addr) = start_server(tmpdir.path(), config);

    let err = assert_err!(quick_client(addr).upload("new.bin", &b"data"[..], |_| {}).await);
    assert_eq!(peer_error(err).0, ErrorCode::AccessViolation);
    assert!(!tmpdir.path().join("new.bin").exists());
}

#[tokio::test]
async fn test_mail_mode_is_rejected() {
    let tmpdir = TempDir::new("scratch").unwrap();
    std::fs::write(tmpdir.path().join("report.txt"), b"hello").unwrap();
    let (_server, addr) = start_server(tmpdir.path(), quick_config());
    let peer = RawPeer::bind().await;

    let request = Packet::ReadReq { path: "report.txt".to_string(), mode: FileMode::Mail, options: vec![] };
    peer.send(&request, addr).await;
    match peer.recv().await.0 {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::Illegal),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_netascii_is_served_as_raw_bytes() {
    let tmpdir = TempDir::new("scratch").unwrap();
    std::fs::write(tmpdir.path().join("notes.txt"), b"line one\nline two\n").unwrap();
    let (_server, addr) = start_server(tmpdir.path(), quick_config());
    let peer = RawPeer::bind().await;

    let request = Packet::ReadReq { path: "notes.txt".to_string(), mode: FileMode::NetAscii, options: vec![] };
    peer.send(&request, addr).await;
    let (data, session) = peer.recv().await;
    assert_eq!(data, Packet::Data { block: 1, data: b"line one\nline two\n".to_vec() });
    peer.send(&Packet::Ack { block: 1 }, session).await;
}

#[tokio::test]
async fn test_failed_upload_leaves_nothing_behind() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let (server, addr) = start_server(tmpdir.path(), quick_config());
    let peer = RawPeer::bind().await;
    let target = tmpdir.path().join("partial.bin");

    peer.send(&wrq("partial.bin", vec![]), addr).await;
    let (ack, session) = peer.recv().await;
    assert_eq!(ack, Packet::Ack { block: 0 });
    peer.send(&Packet::Data { block: 1, data: vec![9; 512] }, session).await;
    assert_eq!(peer.recv().await.0, Packet::Ack { block: 1 });
    assert!(target.exists());

    peer.send(&Packet::Error { code: ErrorCode::Undefined, message: "user cancelled".to_string() }, session).await;
    for _ in 0..50 {
        if !target.exists() && server.active_sessions() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!target.exists());
    assert_eq!(server.active_sessions(), 0);
}

#[tokio::test]
async fn test_duplicate_data_is_reacknowledged_not_rewritten() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let (_server, addr) = start_server(tmpdir.path(), quick_config());
    let peer = RawPeer::bind().await;

    peer.send(&wrq("dup.bin", vec![]), addr).await;
    let (_, session) = peer.recv().await;
    let block = Packet::Data { block: 1, data: vec![1; 512] };
    peer.send(&block, session).await;
    assert_eq!(peer.recv().await.0, Packet::Ack { block: 1 });
    peer.send(&block, session).await;
    assert_eq!(peer.recv().await.0, Packet::Ack { block: 1 });
    peer.send(&Packet::Data { block: 2, data: vec![2; 3] }, session).await;
    assert_eq!(peer.recv().await.0, Packet::Ack { block: 2 });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let written = std::fs::read(tmpdir.path().join("dup.bin")).unwrap();
    assert_eq!(written.len(), 515);
}

#[tokio::test]
async fn test_stop_abandons_sessions_silently() {
    let tmpdir = TempDir::new("scratch").unwrap();
    std::fs::write(tmpdir.path().join("big.bin"), patterned(4000)).unwrap();
    let config = ServerConfig {
        policy: tftp_engine::RetryPolicy { response_timeout: Duration::from_secs(5), ..quick_policy() },
        ..quick_config()
    };
    let (mut server, addr) = start_server(tmpdir.path(), config);
    let peer = RawPeer::bind().await;

    peer.send(&rrq("big.bin", vec![]), addr).await;
    let (_, session) = peer.recv().await;
    server.stop();
    assert!(!server.is_running());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Neither the session nor the request port answers any more.
    peer.send(&Packet::Ack { block: 1 }, session).await;
    peer.send(&rrq("big.bin", vec![]), addr).await;
    peer.expect_silence(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_events_reach_injected_sink() {
    let tmpdir = TempDir::new("scratch").unwrap();
    std::fs::write(tmpdir.path().join("report.txt"), b"hello").unwrap();
    let messages = Arc::new(Mutex::new(Vec::new()));
    let captured = messages.clone();
    let sink = move |level: log::Level, message: &str| captured.lock().unwrap().push((level, message.to_string()));

    let mut server = tftp_engine::Server::new(tmpdir.path(), quick_config()).with_events(Arc::new(sink));
    let addr = server.listen(std::net::Ipv4Addr::LOCALHOST.into(), 0).unwrap();

    let mut out = Vec::new();
    assert_ok!(quick_client(addr).download("report.txt", &mut out, |_| {}).await);
    let err = assert_err!(quick_client(addr).download("absent.txt", &mut out, |_| {}).await);
    assert_eq!(peer_error(err).0, ErrorCode::FileNotFound);
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.stop();

    let messages = messages.lock().unwrap();
    assert!(messages.iter().any(|(level, m)| *level == log::Level::Info && m.contains("Listening on")));
    assert!(messages.iter().any(|(level, m)| *level == log::Level::Info && m.contains("Finished RRQ 'report.txt'")));
    assert!(messages.iter().any(|(level, m)| *level == log::Level::Warn && m.contains("absent.txt")));
}
