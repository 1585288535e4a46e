//! One socket plus one codec, driven as a unit.
//!
//! Two of these exist per session: one facing the game client, one facing
//! the gateway (later the agent server). Tearing a channel down drops the
//! socket and the codec together; callers check liveness before injecting.

use std::io;
use std::net::{IpAddr, Shutdown};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::codec::{CodecFactory, SecureCodec};
use crate::packet::Packet;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Upstream connect gave up after the full retry sequence.
#[derive(Debug, thiserror::Error)]
#[error("failed to connect to {host}:{port} after {} attempts", CONNECT_ATTEMPTS)]
pub struct ConnectError {
    pub host: String,
    pub port: u16,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Handshaking,
    Active,
    Closed,
}

pub struct SecureChannel {
    label: &'static str,
    state: ChannelState,
    stream: Option<TcpStream>,
    codec: Option<Box<dyn SecureCodec + Send>>,
    make_codec: CodecFactory,
    chunk: Vec<u8>,
}

impl SecureChannel {
    /// `max_read` caps the bytes accepted per socket read.
    pub fn new(label: &'static str, max_read: usize, make_codec: CodecFactory) -> Self {
        Self {
            label,
            state: ChannelState::Uninitialized,
            stream: None,
            codec: None,
            make_codec,
            chunk: vec![0; max_read],
        }
    }

    /// A live codec means the channel can carry packets.
    pub fn is_active(&self) -> bool {
        self.codec.is_some()
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Adopts an already-accepted socket and instantiates a fresh codec.
    pub fn adopt(&mut self, stream: TcpStream) {
        self.close();
        if let Err(e) = stream.set_nodelay(true) {
            ::tracing::debug!(channel = self.label, "set_nodelay failed: {:?}", e);
        }
        self.stream = Some(stream);
        self.codec = Some((self.make_codec)());
        self.state = ChannelState::Active;
    }

    /// Opens an outbound connection, trying `host` as a literal address
    /// before falling back to name resolution. The whole sequence is
    /// retried with a fixed back-off before giving up.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectError> {
        self.close();
        for attempt in 1..CONNECT_ATTEMPTS {
            match Self::dial(host, port).await {
                Ok(stream) => {
                    self.adopt(stream);
                    return Ok(());
                }
                Err(e) => {
                    ::tracing::warn!(
                        channel = self.label,
                        attempt,
                        "connect to {}:{} failed: {:?}",
                        host,
                        port,
                        e
                    );
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
            }
        }
        match Self::dial(host, port).await {
            Ok(stream) => {
                self.adopt(stream);
                Ok(())
            }
            Err(source) => Err(ConnectError {
                host: host.to_string(),
                port,
                source,
            }),
        }
    }

    async fn dial(host: &str, port: u16) -> io::Result<TcpStream> {
        match host.parse::<IpAddr>() {
            Ok(ip) => TcpStream::connect((ip, port)).await,
            Err(_) => TcpStream::connect((host, port)).await,
        }
    }

    /// Queues the codec's handshake challenge. Client-facing side only,
    /// immediately after adopt.
    pub fn start_handshake(&mut self) {
        if let Some(codec) = self.codec.as_mut() {
            codec.start_handshake();
            self.state = ChannelState::Handshaking;
        }
    }

    /// Called once the peer acknowledges the handshake.
    pub fn mark_established(&mut self) {
        if self.is_active() {
            self.state = ChannelState::Active;
        }
    }

    /// One socket read, fed straight into the codec.
    ///
    /// Pends forever while the channel holds no socket, so it can sit in a
    /// `select!` arm unconditionally. `Ok(0)` is an orderly remote close;
    /// the channel closes itself and will not read again.
    pub async fn recv(&mut self) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return std::future::pending().await;
        };
        let n = stream.read(&mut self.chunk).await?;
        if n == 0 {
            self.close();
            return Ok(0);
        }
        if let Some(codec) = self.codec.as_mut() {
            if let Err(e) = codec.feed(&self.chunk[..n]) {
                ::tracing::warn!(channel = self.label, "decode failure: {}", e);
                self.close();
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        }
        Ok(n)
    }

    /// Next decoded packet, if the codec has one queued.
    pub fn next_packet(&mut self) -> Option<Packet> {
        self.codec.as_mut()?.next_inbound()
    }

    /// Hands a packet to the codec for sending. False when the channel
    /// has no live codec; the caller decides what a drop means.
    pub fn inject(&mut self, packet: &Packet) -> bool {
        match self.codec.as_mut() {
            Some(codec) => {
                codec.enqueue(packet);
                true
            }
            None => false,
        }
    }

    /// Writes every codec-ready outbound buffer to the socket, whole
    /// buffers in order. The codec's framing assumes whole-packet
    /// delivery, so each buffer completes fully before the next starts.
    /// The first write failure closes the channel and reports false.
    pub async fn flush(&mut self) -> bool {
        loop {
            let buf = match self.codec.as_mut() {
                Some(codec) => match codec.next_outbound() {
                    Some(buf) => buf,
                    None => return true,
                },
                None => return true,
            };
            let Some(stream) = self.stream.as_mut() else {
                return true;
            };
            if let Err(e) = stream.write_all(&buf).await {
                ::tracing::warn!(channel = self.label, "write failure: {:?}", e);
                self.close();
                return false;
            }
        }
    }

    /// Shuts the socket down and discards the codec. Idempotent; shutdown
    /// errors are ignored since the peer may already have half-closed.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Ok(std_stream) = stream.into_std() {
                let _ = std_stream.shutdown(Shutdown::Both);
            }
        }
        self.codec = None;
        if self.state != ChannelState::Uninitialized {
            self.state = ChannelState::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ClearCodec;

    #[test]
    fn inject_without_a_codec_reports_false() {
        let mut channel = SecureChannel::new("test", 4096, ClearCodec::factory);
        assert!(!channel.inject(&Packet::new(0x1234, vec![])));
        assert_eq!(channel.state(), ChannelState::Uninitialized);
    }

    #[tokio::test]
    async fn adopt_arms_a_fresh_codec() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        client.await.unwrap();

        let mut channel = SecureChannel::new("test", 4096, ClearCodec::factory);
        channel.adopt(accepted);
        assert!(channel.is_active());
        assert!(channel.inject(&Packet::new(0x1234, vec![1])));

        channel.close();
        assert!(!channel.is_active());
        assert_eq!(channel.state(), ChannelState::Closed);
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn connect_gives_up_after_retries() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let started = std::time::Instant::now();
        let mut channel = SecureChannel::new("test", 4096, ClearCodec::factory);
        let result = channel.connect(&addr.ip().to_string(), addr.port()).await;
        let err = result.unwrap_err();
        assert!(
            err.to_string()
                .contains(&format!("after {CONNECT_ATTEMPTS} attempts")),
            "unexpected message: {err}"
        );
        assert!(!channel.is_active());
        // Two back-off sleeps between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }
}
