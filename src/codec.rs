//! The secure-codec seam between raw socket bytes and decoded packets.
//!
//! The real protocol codec (checksum, XOR/blowfish transform, handshake
//! challenge/response) is an external collaborator; this module only pins
//! down its contract and ships [`ClearCodec`], a plaintext implementation
//! with the same framing shape, so the proxy runs end to end without it.

use std::collections::VecDeque;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::packet::Packet;

/// Decode-side failures. Any of these poisons the byte stream, so the
/// owning channel closes on the first one.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame length {0} exceeds the protocol maximum")]
    Oversize(usize),
}

/// Narrow contract of the protocol codec.
///
/// Raw inbound bytes go in through [`feed`](SecureCodec::feed) and come out
/// as zero or more decoded packets; injected packets come out as zero or
/// more ready-to-send byte buffers. [`start_handshake`](SecureCodec::start_handshake)
/// is one-shot and only meaningful on the client-facing side, immediately
/// after accept.
pub trait SecureCodec: Send {
    fn feed(&mut self, bytes: &[u8]) -> Result<(), CodecError>;
    fn next_inbound(&mut self) -> Option<Packet>;
    fn enqueue(&mut self, packet: &Packet);
    fn next_outbound(&mut self) -> Option<Vec<u8>>;
    fn start_handshake(&mut self);
}

/// Builds a fresh codec for every adopted or connected socket.
pub type CodecFactory = fn() -> Box<dyn SecureCodec + Send>;

const HEADER_LEN: usize = 6;
const FLAG_ENCRYPTED: u16 = 0x0001;
const FLAG_MASSIVE: u16 = 0x0002;
const MAX_PAYLOAD: usize = 0x7FFF;

/// Plaintext stand-in for the cryptographic codec.
///
/// Wire shape per message, little endian:
/// `[u16 payload_len][u16 opcode][u16 flags]` followed by the payload,
/// where flags bit 0 marks an encrypted message and bit 1 a massive one.
pub struct ClearCodec {
    inbound_raw: Vec<u8>,
    inbound: VecDeque<Packet>,
    outbound: VecDeque<Vec<u8>>,
}

impl ClearCodec {
    pub fn new() -> Self {
        Self {
            inbound_raw: Vec::with_capacity(4096),
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
        }
    }

    pub fn factory() -> Box<dyn SecureCodec + Send> {
        Box::new(Self::new())
    }

    /// Serializes one packet into its wire form. Also used by the test
    /// harness to speak the protocol from the far side.
    pub fn encode(packet: &Packet) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + packet.payload.len());
        let mut flags = 0u16;
        if packet.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if packet.massive {
            flags |= FLAG_MASSIVE;
        }
        // Writes to a Vec cannot fail.
        out.write_u16::<LittleEndian>(packet.payload.len() as u16)
            .unwrap();
        out.write_u16::<LittleEndian>(packet.opcode).unwrap();
        out.write_u16::<LittleEndian>(flags).unwrap();
        out.extend_from_slice(&packet.payload);
        out
    }
}

impl Default for ClearCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureCodec for ClearCodec {
    fn feed(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.inbound_raw.extend_from_slice(bytes);
        while self.inbound_raw.len() >= HEADER_LEN {
            let mut header = &self.inbound_raw[..HEADER_LEN];
            let len = header.read_u16::<LittleEndian>().unwrap() as usize;
            let opcode = header.read_u16::<LittleEndian>().unwrap();
            let flags = header.read_u16::<LittleEndian>().unwrap();
            if len > MAX_PAYLOAD {
                return Err(CodecError::Oversize(len));
            }
            if self.inbound_raw.len() < HEADER_LEN + len {
                break;
            }
            let payload = self.inbound_raw[HEADER_LEN..HEADER_LEN + len].to_vec();
            self.inbound_raw.drain(..HEADER_LEN + len);
            self.inbound.push_back(Packet {
                opcode,
                payload,
                encrypted: flags & FLAG_ENCRYPTED != 0,
                massive: flags & FLAG_MASSIVE != 0,
            });
        }
        Ok(())
    }

    fn next_inbound(&mut self) -> Option<Packet> {
        self.inbound.pop_front()
    }

    fn enqueue(&mut self, packet: &Packet) {
        self.outbound.push_back(Self::encode(packet));
    }

    fn next_outbound(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop_front()
    }

    fn start_handshake(&mut self) {
        let nonce: u32 = rand::random();
        let challenge = Packet::new(crate::opcode::HANDSHAKE_CHALLENGE, nonce.to_le_bytes().to_vec());
        self.enqueue(&challenge);
    }
}
