//! A transparent man-in-the-middle proxy for an MMO gateway/agent protocol.
//!
//! Sits between a game client and the gateway/agent server cluster,
//! relaying traffic while a bot on the auxiliary port observes every
//! packet and can block opcodes or inject synthetic traffic. The
//! server-initiated gateway-to-agent handoff is followed transparently by
//! rewriting the in-band redirect to point back at this process.

pub mod blocklist;
pub mod channel;
pub mod codec;
pub mod config;
pub mod fanout;
pub mod frame;
pub mod opcode;
pub mod packet;
pub mod relay;
