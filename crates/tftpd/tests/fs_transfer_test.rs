//! Downloads from a temporary directory through the filesystem handler.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use tempfile::{TempDir, tempdir};
use tftp::{TftpServer, TftpServerConfig, build_ack, build_rrq, parse_data, parse_error};
use tftpd::FsReadHandler;
use tokio::net::UdpSocket;
use tokio::time::timeout;

async fn start_server() -> (SocketAddr, TempDir) {
    let temp_dir = tempdir().unwrap();
    std::fs::write(temp_dir.path().join("kernel.bin"), (0..1300u32).map(|i| (i % 251) as u8).collect::<Vec<_>>())
        .unwrap();
    std::fs::write(temp_dir.path().join("motd.txt"), b"one\ntwo\r\nthree\r").unwrap();

    let config = TftpServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    let mut server = TftpServer::new(config, FsReadHandler::new(temp_dir.path()).unwrap());
    let addr = server.bind().await.unwrap();
    tokio::spawn(async move { server.run().await });

    (addr, temp_dir)
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("no packet from server")
        .unwrap();
    buf.truncate(len);
    buf
}

/// Download `filename` acking every block; returns the content or the error packet.
async fn download(server: SocketAddr, filename: &str, mode: &str) -> Result<Vec<u8>, (u16, String)> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&build_rrq(filename, mode, &BTreeMap::new()), server)
        .await
        .unwrap();

    let mut content = Vec::new();
    loop {
        let packet = recv(&socket).await;
        if let Ok(error) = parse_error(&packet) {
            return Err(error);
        }

        let (block, payload) = parse_data(&packet).unwrap();
        content.extend_from_slice(payload);
        socket.send_to(&build_ack(block), server).await.unwrap();

        if payload.len() < 512 {
            return Ok(content);
        }
    }
}

#[tokio::test]
async fn test_octet_download() {
    let (addr, temp_dir) = start_server().await;

    let content = download(addr, "kernel.bin", "octet").await.unwrap();
    assert_eq!(content, std::fs::read(temp_dir.path().join("kernel.bin")).unwrap());

    let content = download(addr, "/kernel.bin", "OCTET").await.unwrap();
    assert_eq!(content.len(), 1300);
}

#[tokio::test]
async fn test_netascii_download() {
    let (addr, _temp_dir) = start_server().await;

    let content = download(addr, "motd.txt", "netascii").await.unwrap();
    assert_eq!(content, b"one\r\ntwo\r\nthree\r\0");
}

#[tokio::test]
async fn test_error_replies() {
    let (addr, _temp_dir) = start_server().await;

    let (code, _) = download(addr, "missing.bin", "octet").await.unwrap_err();
    assert_eq!(code, 1);

    let (code, _) = download(addr, "../etc/passwd", "octet").await.unwrap_err();
    assert_eq!(code, 2);

    let (code, message) = download(addr, "kernel.bin", "mail").await.unwrap_err();
    assert_eq!(code, 4);
    assert!(message.contains("mail"));
}
