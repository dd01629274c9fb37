mod common;

use common::*;
use std::time::Duration;
use tempdir::TempDir;
use tftp_engine::{Client, ClientOptions, Packet, Progress};
use tokio_test::assert_ok;

#[tokio::test]
async fn test_garbled_options_fall_back_to_defaults() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let contents = patterned(600);
    std::fs::write(tmpdir.path().join("boot.img"), &contents).unwrap();
    let (_server, addr) = start_server(tmpdir.path(), quick_config());
    let peer = RawPeer::bind().await;

    let garbled = pairs(&[("blksize", "huge"), ("frobnicate", "yes"), ("timeout", "-3")]);
    peer.send(&rrq("boot.img", garbled), addr).await;

    let (first, session) = peer.recv().await;
    assert_eq!(first, Packet::Data { block: 1, data: contents[..512].to_vec() });
    peer.send(&Packet::Ack { block: 1 }, session).await;
    assert_eq!(peer.recv().await.0, Packet::Data { block: 2, data: contents[512..].to_vec() });
    peer.send(&Packet::Ack { block: 2 }, session).await;
    peer.expect_silence(Duration::from_millis(400)).await;
}

#[tokio::test]
async fn test_oack_replaces_first_data() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let contents = patterned(3000);
    std::fs::write(tmpdir.path().join("kernel"), &contents).unwrap();
    let (_server, addr) = start_server(tmpdir.path(), quick_config());
    let peer = RawPeer::bind().await;

    let requested = pairs(&[("BLKSIZE", "100000"), ("tsize", "0"), ("timeout", "0"), ("windowsize", "4")]);
    peer.send(&rrq("kernel", requested), addr).await;

    let (oack, session) = peer.recv().await;
    assert_eq!(
        oack,
        Packet::OptionAck { options: pairs(&[("blksize", "65464"), ("tsize", "3000"), ("timeout", "1")]) }
    );

    // OACK stands in for the first block; ACK(0) releases the data.
    peer.send(&Packet::Ack { block: 0 }, session).await;
    assert_eq!(peer.recv().await.0, Packet::Data { block: 1, data: contents.clone() });
    peer.send(&Packet::Ack { block: 1 }, session).await;
    peer.expect_silence(Duration::from_millis(400)).await;
}

#[tokio::test]
async fn test_write_request_options_are_acknowledged() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let (_server, addr) = start_server(tmpdir.path(), quick_config());
    let peer = RawPeer::bind().await;

    peer.send(&wrq("small-blocks.bin", pairs(&[("blksize", "16"), ("tsize", "20")])), addr).await;
    let (oack, session) = peer.recv().await;
    assert_eq!(oack, Packet::OptionAck { options: pairs(&[("blksize", "16"), ("tsize", "20")]) });

    peer.send(&Packet::Data { block: 1, data: vec![1; 16] }, session).await;
    assert_eq!(peer.recv().await.0, Packet::Ack { block: 1 });
    peer.send(&Packet::Data { block: 2, data: vec![2; 4] }, session).await;
    assert_eq!(peer.recv().await.0, Packet::Ack { block: 2 });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut expected = vec![1; 16];
    expected.extend_from_slice(&[2; 4]);
    assert_eq!(std::fs::read(tmpdir.path().join("small-blocks.bin")).unwrap(), expected);
}

#[tokio::test]
async fn test_client_negotiates_blksize_and_tsize() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let contents = patterned(3000);
    std::fs::write(tmpdir.path().join("image.bin"), &contents).unwrap();
    let (_server, addr) = start_server(tmpdir.path(), quick_config());

    let options = ClientOptions { blksize: Some(1024), tsize: true, policy: quick_policy(), ..ClientOptions::default() };
    let client = Client::new(addr, options);

    let mut out = Vec::new();
    let mut seen = Vec::new();
    let bytes = assert_ok!(client.download("image.bin", &mut out, |p| seen.push(p)).await);
    assert_eq!(bytes, 3000);
    assert_eq!(out, contents);
    assert_eq!(
        seen,
        vec![
            Progress { transferred: 1024, total: Some(3000) },
            Progress { transferred: 2048, total: Some(3000) },
            Progress { transferred: 3000, total: Some(3000) },
        ]
    );
}

#[tokio::test]
async fn test_client_upload_announces_size() {
    let tmpdir = TempDir::new("scratch").unwrap();
    let served = tmpdir.path().join("served");
    std::fs::create_dir(&served).unwrap();
    let local = tmpdir.path().join("local.bin");
    let contents = patterned(5000);
    std::fs::write(&local, &contents).unwrap();
    let (_server, addr) = start_server(&served, quick_config());

    let options = ClientOptions { blksize: Some(2048), tsize: true, policy: quick_policy(), ..ClientOptions::default() };
    let mut totals = Vec::new();
    let bytes = assert_ok!(
        Client::new(addr, options)
            .upload_file("remote.bin", &local, |p| totals.push(p.total))
            .await
    );
    assert_eq!(bytes, 5000);
    assert_eq!(totals, vec![Some(5000); 3]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(std::fs::read(served.join("remote.bin")).unwrap(), contents);
}

#[tokio::test]
async fn test_query_size_against_server() {
    let tmpdir = TempDir::new("scratch").unwrap();
    std::fs::write(tmpdir.path().join("big.iso"), patterned(123_456)).unwrap();
    let (server, addr) = start_server(tmpdir.path(), quick_config());

    assert_eq!(quick_client(addr).query_size("big.iso").await.unwrap(), Some(123_456));

    // The ERROR that ends the query tears the server's session down straight away.
    for _ in 0..50 {
        if server.active_sessions() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.active_sessions(), 0);
}
