//! Game-protocol opcodes the relay cares about.
//!
//! Everything else passes through untouched; these three are the only
//! messages the engine interprets.

/// Handshake challenge the codec queues toward a freshly accepted client.
pub const HANDSHAKE_CHALLENGE: u16 = 0x5000;

/// "Connection acknowledged" sent by the client once the handshake settles.
/// Consumed by the engine as a liveness signal, never forwarded upstream.
pub const HANDSHAKE_ACCEPT: u16 = 0x9000;

/// Gateway login reply. When its leading status byte is 1 it carries the
/// agent-server redirect (login id, host, port) that the engine intercepts
/// and rewrites to point back at itself.
pub const GATEWAY_LOGIN_REPLY: u16 = 0xA102;
