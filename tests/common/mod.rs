//! Shared harness for the scenario tests: a full proxy on ephemeral
//! ports, plus peers speaking the plaintext codec framing from the far
//! side (fake game client, fake gateway/agent servers, observers).

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use gateproxy::codec::{ClearCodec, SecureCodec};
use gateproxy::config::Config;
use gateproxy::fanout;
use gateproxy::frame::{Frame, FrameBuffer};
use gateproxy::packet::Packet;
use gateproxy::relay::RelayEngine;

pub const WAIT: Duration = Duration::from_secs(5);

/// Lets in-flight control frames and registrations land before the test
/// drives dependent traffic through the relay.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

pub struct Proxy {
    pub client_addr: SocketAddr,
    pub observer_addr: SocketAddr,
    // Dropping this tells the engine to stop; hold it for the test's life.
    _shutdown: watch::Sender<bool>,
}

/// Boots the fan-out and the relay engine against a fake gateway.
pub async fn start_proxy(gateway_addr: SocketAddr) -> Proxy {
    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let observer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();
    let observer_addr = observer_listener.local_addr().unwrap();

    let config = Config {
        gateway_host: gateway_addr.ip().to_string(),
        gateway_port: gateway_addr.port(),
        listen_ip: "127.0.0.1".to_string(),
        client_bind: client_addr.port(),
        observer_bind: observer_addr.port(),
        max_read: 16384,
    };

    let (mirror_tx, mirror_rx) = mpsc::channel(512);
    let (command_tx, command_rx) = mpsc::channel(64);
    tokio::spawn(fanout::run(observer_listener, mirror_rx, command_tx));

    let engine = RelayEngine::new(
        &config,
        client_listener,
        mirror_tx,
        command_rx,
        ClearCodec::factory,
    )
    .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(engine.run(shutdown_rx));

    Proxy {
        client_addr,
        observer_addr,
        _shutdown: shutdown_tx,
    }
}

/// One end of a game-protocol connection.
pub struct Peer {
    stream: TcpStream,
    codec: ClearCodec,
}

impl Peer {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(WAIT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .unwrap();
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            codec: ClearCodec::new(),
        }
    }

    pub async fn send(&mut self, packet: &Packet) {
        self.stream
            .write_all(&ClearCodec::encode(packet))
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> Packet {
        timeout(WAIT, async {
            loop {
                if let Some(packet) = self.codec.next_inbound() {
                    return packet;
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "peer closed while waiting for a packet");
                self.codec.feed(&chunk[..n]).unwrap();
            }
        })
        .await
        .expect("timed out waiting for a packet")
    }

    /// Waits for the remote side to close the connection.
    pub async fn recv_eof(&mut self) {
        timeout(WAIT, async {
            let mut chunk = [0u8; 4096];
            loop {
                // A reset also counts as closed here.
                let n = self.stream.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    return;
                }
            }
        })
        .await
        .expect("timed out waiting for the peer to close")
    }
}

/// Accepts the proxy's upstream leg on a fake server listener.
pub async fn accept_peer(listener: &TcpListener) -> Peer {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("accept timed out")
        .unwrap();
    Peer::from_stream(stream)
}

/// A bot connection on the auxiliary channel.
pub struct Observer {
    stream: TcpStream,
    frames: FrameBuffer,
}

impl Observer {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(WAIT, TcpStream::connect(addr))
            .await
            .expect("observer connect timed out")
            .unwrap();
        // Give the fan-out a moment to register the connection before
        // the test relies on receiving broadcasts.
        settle().await;
        Self {
            stream,
            frames: FrameBuffer::new(),
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) {
        self.stream.write_all(&frame.to_wire()).await.unwrap();
    }

    pub async fn recv_frame(&mut self) -> Frame {
        timeout(WAIT, async {
            loop {
                if let Some(frame) = self.frames.next_frame() {
                    return frame;
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "fan-out closed while waiting for a frame");
                self.frames.extend(&chunk[..n]);
            }
        })
        .await
        .expect("timed out waiting for a mirrored frame")
    }
}
