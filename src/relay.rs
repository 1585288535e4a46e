//! The session state machine at the heart of the proxy.
//!
//! One client at a time. The engine adopts an inbound client socket,
//! opens the matching upstream leg (gateway first, then the staged agent
//! target after a redirect), and pumps decoded packets between the two on
//! a fixed 10 ms cadence. Every forwarded packet is mirrored to the
//! auxiliary fan-out; opcodes in the block set are dropped silently; the
//! in-band agent redirect is intercepted and rewritten so the client
//! reconnects through this process instead of going straight to the agent
//! server.
//!
//! The polling cadence is deliberate: the codec may batch several decoded
//! packets per socket read, and a single synchronous checkpoint per tick
//! keeps the block set and the redirect rewrite from interleaving
//! partially-processed state across the two legs.

use std::io::{Cursor, Read};
use std::net::SocketAddr;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::blocklist::BlockSet;
use crate::channel::SecureChannel;
use crate::codec::CodecFactory;
use crate::config::Config;
use crate::frame::{Direction, Frame};
use crate::opcode;
use crate::packet::Packet;

const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// Address the rewritten redirect points the client at.
const LOOPBACK_HOST: &str = "127.0.0.1";

/// What the auxiliary fan-out asks the engine to do.
#[derive(Debug)]
pub enum RelayCommand {
    Block(u16),
    Unblock(u16),
    Inject {
        direction: Direction,
        opcode: u16,
        payload: Vec<u8>,
    },
}

enum Event {
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    ClientRead(std::io::Result<usize>),
    UpstreamRead(std::io::Result<usize>),
    Pump,
    Command(Option<RelayCommand>),
    Shutdown,
}

pub struct RelayEngine {
    listener: TcpListener,
    /// Actual client-listener port; the redirect rewrite points here.
    listen_port: u16,
    gateway_host: String,
    gateway_port: u16,
    client: SecureChannel,
    upstream: SecureChannel,
    /// Agent target staged by an intercepted redirect, consumed exactly
    /// once by the next inbound client connection.
    pending_redirect: Option<(String, u16)>,
    blocked: BlockSet,
    mirror_tx: mpsc::Sender<Frame>,
    commands: mpsc::Receiver<RelayCommand>,
}

impl RelayEngine {
    pub fn new(
        config: &Config,
        listener: TcpListener,
        mirror_tx: mpsc::Sender<Frame>,
        commands: mpsc::Receiver<RelayCommand>,
        make_codec: CodecFactory,
    ) -> anyhow::Result<Self> {
        let listen_port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            listen_port,
            gateway_host: config.gateway_host.clone(),
            gateway_port: config.gateway_port,
            client: SecureChannel::new("client", config.max_read, make_codec),
            upstream: SecureChannel::new("upstream", config.max_read, make_codec),
            pending_redirect: None,
            blocked: BlockSet::new(),
            mirror_tx,
            commands,
        })
    }

    /// Runs until the shutdown signal flips or the command lane dies.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(PUMP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let event = tokio::select! {
                accepted = self.listener.accept() => Event::Accepted(accepted),
                n = self.client.recv() => Event::ClientRead(n),
                n = self.upstream.recv() => Event::UpstreamRead(n),
                _ = ticker.tick() => Event::Pump,
                command = self.commands.recv() => Event::Command(command),
                _ = shutdown.changed() => Event::Shutdown,
            };
            match event {
                Event::Accepted(Ok((stream, peer))) => self.start_session(stream, peer).await,
                Event::Accepted(Err(e)) => {
                    ::tracing::warn!("failed to accept a client: {:?}", e);
                }
                Event::ClientRead(Ok(0)) => self.teardown("client disconnected"),
                Event::ClientRead(Err(e)) => {
                    ::tracing::warn!("client read failure: {:?}", e);
                    self.teardown("client read failure");
                }
                Event::UpstreamRead(Ok(0)) => self.teardown("upstream disconnected"),
                Event::UpstreamRead(Err(e)) => {
                    ::tracing::warn!("upstream read failure: {:?}", e);
                    self.teardown("upstream read failure");
                }
                Event::ClientRead(Ok(_)) | Event::UpstreamRead(Ok(_)) => {
                    // Decoded packets wait for the next pump tick.
                }
                Event::Pump => self.pump().await,
                Event::Command(Some(command)) => self.apply_command(command),
                Event::Command(None) => {
                    anyhow::bail!("auxiliary fan-out command lane closed");
                }
                Event::Shutdown => {
                    self.stop();
                    return Ok(());
                }
            }
        }
    }

    /// Closes both legs and stops accepting. Idempotent.
    fn stop(&mut self) {
        ::tracing::info!("engine stopping");
        self.client.close();
        self.upstream.close();
    }

    async fn start_session(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.client.is_active() || self.upstream.is_active() {
            ::tracing::info!("new client supersedes the current session");
            self.client.close();
            self.upstream.close();
        }
        ::tracing::info!(%peer, "starting new session...");
        self.client.adopt(stream);
        self.client.start_handshake();
        if !self.client.flush().await {
            ::tracing::warn!("client vanished during handshake");
            return;
        }

        // The staged redirect target is consumed exactly once, whether or
        // not the connect below succeeds.
        let (host, port) = match self.pending_redirect.take() {
            Some(target) => target,
            None => (self.gateway_host.clone(), self.gateway_port),
        };
        ::tracing::info!("connecting upstream to {}:{}", host, port);
        if let Err(e) = self.upstream.connect(&host, port).await {
            // Non-fatal: no point holding a client with nowhere to
            // forward, so drop it and wait for the next one.
            ::tracing::warn!("upstream leg failed: {}", e);
            self.client.close();
        }
    }

    fn teardown(&mut self, reason: &str) {
        if self.client.is_active() || self.upstream.is_active() {
            ::tracing::info!(reason, "session closed");
        }
        self.client.close();
        self.upstream.close();
    }

    /// One pump cycle: drain both legs' decoded packets, then flush each
    /// leg's outbound bytes independently.
    async fn pump(&mut self) {
        self.pump_client().await;
        if self.pump_upstream().await {
            // Redirect rewrite already flushed the client and closed both
            // legs; nothing left to do this cycle.
            return;
        }
        let client_alive = self.client.flush().await;
        let upstream_alive = self.upstream.flush().await;
        if !client_alive || !upstream_alive {
            self.teardown("flush failure");
        }
    }

    async fn pump_client(&mut self) {
        while let Some(packet) = self.client.next_packet() {
            if self.blocked.contains(packet.opcode) {
                ::tracing::trace!(opcode = packet.opcode, "blocked client packet");
                continue;
            }
            if packet.opcode == opcode::HANDSHAKE_ACCEPT {
                // Pure liveness signal; the upstream leg runs its own
                // handshake, so this never forwards.
                self.client.mark_established();
                continue;
            }
            self.mirror(&packet, Direction::from_client(packet.encrypted));
            if !self.upstream.inject(&packet) {
                ::tracing::debug!(opcode = packet.opcode, "upstream leg inactive, packet dropped");
            }
        }
    }

    /// Returns true when a redirect rewrite ended the cycle early.
    async fn pump_upstream(&mut self) -> bool {
        while let Some(packet) = self.upstream.next_packet() {
            if self.blocked.contains(packet.opcode) {
                ::tracing::trace!(opcode = packet.opcode, "blocked upstream packet");
                continue;
            }
            if packet.opcode == opcode::GATEWAY_LOGIN_REPLY {
                if let Some(redirect) = parse_agent_redirect(&packet.payload) {
                    self.apply_redirect(&packet, redirect).await;
                    return true;
                }
            }
            self.mirror(&packet, Direction::from_server(packet.encrypted));
            if !self.client.inject(&packet) {
                ::tracing::debug!(opcode = packet.opcode, "client leg inactive, packet dropped");
            }
        }
        false
    }

    /// Stages the real agent target and points the client back at this
    /// process instead, then drops both legs so the client reconnects.
    async fn apply_redirect(&mut self, original: &Packet, redirect: AgentRedirect) {
        ::tracing::info!(
            login_id = redirect.login_id,
            "intercepting redirect to {}:{}",
            redirect.host,
            redirect.port
        );
        let rewritten = Packet {
            opcode: original.opcode,
            payload: build_agent_redirect(redirect.login_id, LOOPBACK_HOST, self.listen_port),
            encrypted: original.encrypted,
            massive: original.massive,
        };
        self.pending_redirect = Some((redirect.host, redirect.port));
        self.client.inject(&rewritten);
        // The client must receive the rewritten reply before the legs go
        // down, so this flush cannot wait for the timer cadence.
        self.client.flush().await;
        self.client.close();
        self.upstream.close();
    }

    /// Mirroring is best-effort and never blocks the pump: if the fan-out
    /// cannot keep up the copy is dropped, not the session.
    fn mirror(&mut self, packet: &Packet, direction: Direction) {
        let frame = Frame::new(packet.opcode, direction, packet.payload.clone());
        match self.mirror_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                ::tracing::warn!(opcode = packet.opcode, "mirror lane full, copy dropped");
            }
            Err(TrySendError::Closed(_)) => {
                ::tracing::trace!("mirror lane closed, copy dropped");
            }
        }
    }

    fn apply_command(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Block(op) => {
                ::tracing::info!(opcode = op, "blocking opcode");
                self.blocked.block(op);
            }
            RelayCommand::Unblock(op) => {
                ::tracing::info!(opcode = op, "unblocking opcode");
                self.blocked.unblock(op);
            }
            RelayCommand::Inject {
                direction,
                opcode,
                payload,
            } => {
                let packet = Packet {
                    opcode,
                    payload,
                    encrypted: direction.is_encrypted(),
                    massive: false,
                };
                let delivered = if direction.is_client_leg() {
                    self.client.inject(&packet)
                } else {
                    self.upstream.inject(&packet)
                };
                if !delivered {
                    ::tracing::debug!(opcode, "injection dropped, leg inactive");
                }
            }
        }
    }
}

struct AgentRedirect {
    login_id: u32,
    host: String,
    port: u16,
}

/// Parses the redirect payload: `u8 status, u32 login_id, u16 host_len,
/// host bytes, u16 port`, little endian. Anything short, malformed, or
/// with a non-success status is not a redirect and forwards untouched.
fn parse_agent_redirect(payload: &[u8]) -> Option<AgentRedirect> {
    let mut cursor = Cursor::new(payload);
    let status = cursor.read_u8().ok()?;
    if status != 1 {
        return None;
    }
    let login_id = cursor.read_u32::<LittleEndian>().ok()?;
    let host_len = cursor.read_u16::<LittleEndian>().ok()? as usize;
    let mut host = vec![0; host_len];
    cursor.read_exact(&mut host).ok()?;
    let host = String::from_utf8(host).ok()?;
    let port = cursor.read_u16::<LittleEndian>().ok()?;
    Some(AgentRedirect {
        login_id,
        host,
        port,
    })
}

fn build_agent_redirect(login_id: u32, host: &str, port: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + host.len());
    out.push(1);
    // Writes to a Vec cannot fail.
    out.write_u32::<LittleEndian>(login_id).unwrap();
    out.write_u16::<LittleEndian>(host.len() as u16).unwrap();
    out.extend_from_slice(host.as_bytes());
    out.write_u16::<LittleEndian>(port).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_payload_round_trips() {
        let payload = build_agent_redirect(42, "10.0.0.5", 16000);
        let redirect = parse_agent_redirect(&payload).unwrap();
        assert_eq!(redirect.login_id, 42);
        assert_eq!(redirect.host, "10.0.0.5");
        assert_eq!(redirect.port, 16000);
    }

    #[test]
    fn failed_login_is_not_a_redirect() {
        let mut payload = build_agent_redirect(42, "10.0.0.5", 16000);
        payload[0] = 2;
        assert!(parse_agent_redirect(&payload).is_none());
    }

    #[test]
    fn truncated_redirect_is_rejected() {
        let payload = build_agent_redirect(42, "10.0.0.5", 16000);
        for len in 0..payload.len() {
            assert!(
                parse_agent_redirect(&payload[..len]).is_none(),
                "accepted a {len}-byte prefix"
            );
        }
    }

    #[test]
    fn empty_host_is_representable() {
        let payload = build_agent_redirect(7, "", 1);
        let redirect = parse_agent_redirect(&payload).unwrap();
        assert_eq!(redirect.host, "");
        assert_eq!(redirect.port, 1);
    }
}
