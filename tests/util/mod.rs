// tests/util.rs
//! Shared fake visual-interface peers for integration tests

#![allow(dead_code)]

use myoctl_core::bridge::messages::{Frame, MAX_DATAGRAM_LEN};
use myoctl_core::types::TaskCategory;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Peer that acks handshakes and then emits `label_count` ground-truth
/// points (10 ms apart) toward whoever shook hands
pub async fn spawn_feedback_peer(
    task: TaskCategory,
    label_count: u32,
) -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        let mut sent = 0u32;
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    if let Some(Frame::Handshake { token }) = Frame::decode(&buf[..len]) {
                        let ack = Frame::HandshakeAck { token }.encode().unwrap();
                        let _ = socket.send_to(&ack, from).await;
                        while sent < label_count {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            let label = Frame::GroundTruth {
                                task,
                                values: vec![sent as f32],
                                timestamp_us: u64::from(sent) * 10_000,
                            };
                            let _ = socket.send_to(&label.encode().unwrap(), from).await;
                            sent += 1;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });
    (addr, handle)
}

/// Peer that acks handshakes and forwards every later frame it receives
pub async fn spawn_recording_peer() -> (
    SocketAddr,
    mpsc::UnboundedReceiver<Frame>,
    JoinHandle<()>,
) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            match Frame::decode(&buf[..len]) {
                Some(Frame::Handshake { token }) => {
                    let ack = Frame::HandshakeAck { token }.encode().unwrap();
                    let _ = socket.send_to(&ack, from).await;
                }
                Some(frame) => {
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
                None => {}
            }
        }
    });
    (addr, rx, handle)
}
