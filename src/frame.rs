//! Wire format and reassembly for the auxiliary (observer) channel.
//!
//! Observers speak a small protocol of their own: a 6-byte little-endian
//! header `[u16 payload_len][u16 opcode][u8 direction][u8 reserved]`
//! followed by the payload. Opcodes 1 and 2 are reserved for block/unblock
//! control; anything else is a mirrored or injected game packet.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Add one game opcode to the block set. Payload: `u16` game opcode.
pub const CONTROL_BLOCK: u16 = 1;
/// Remove one game opcode from the block set. No-op if absent.
pub const CONTROL_UNBLOCK: u16 = 2;

const HEADER_LEN: usize = 6;

/// Which leg a mirrored packet came from, and whether it was encrypted
/// on the game wire. Injected frames reuse the same tag to pick the leg
/// the packet is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    FromServer = 1,
    FromClient = 2,
    FromServerEncrypted = 3,
    FromClientEncrypted = 4,
}

impl Direction {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::FromServer),
            2 => Some(Self::FromClient),
            3 => Some(Self::FromServerEncrypted),
            4 => Some(Self::FromClientEncrypted),
            _ => None,
        }
    }

    pub fn from_client(encrypted: bool) -> Self {
        if encrypted {
            Self::FromClientEncrypted
        } else {
            Self::FromClient
        }
    }

    pub fn from_server(encrypted: bool) -> Self {
        if encrypted {
            Self::FromServerEncrypted
        } else {
            Self::FromServer
        }
    }

    /// True for the two client-leg tags.
    pub fn is_client_leg(self) -> bool {
        matches!(self, Self::FromClient | Self::FromClientEncrypted)
    }

    pub fn is_encrypted(self) -> bool {
        matches!(self, Self::FromServerEncrypted | Self::FromClientEncrypted)
    }
}

/// One complete auxiliary-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u16,
    pub direction: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: u16, direction: Direction, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            direction: direction as u8,
            payload,
        }
    }

    /// Block/unblock control frame carrying one game opcode.
    pub fn control(opcode: u16, game_opcode: u16) -> Self {
        Self {
            opcode,
            direction: 0,
            payload: game_opcode.to_le_bytes().to_vec(),
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.write_u16::<LittleEndian>(self.payload.len() as u16)
            .unwrap();
        out.write_u16::<LittleEndian>(self.opcode).unwrap();
        out.push(self.direction);
        out.push(0);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Per-observer reassembly buffer.
///
/// Bytes accumulate across reads; complete frames are drained off the
/// front so already-extracted bytes are never re-parsed and only the
/// unconsumed tail remains.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extracts the next complete frame, if the buffer holds one.
    /// A short buffer is not an error, just "wait for more data".
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let mut header = &self.buf[..HEADER_LEN];
        let len = header.read_u16::<LittleEndian>().unwrap() as usize;
        let opcode = header.read_u16::<LittleEndian>().unwrap();
        let direction = self.buf[4];
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Some(Frame {
            opcode,
            direction,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(buf: &mut FrameBuffer) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = buf.next_frame() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn control_frame_round_trips() {
        let wire = Frame::control(CONTROL_BLOCK, 0x1234).to_wire();

        let mut buf = FrameBuffer::new();
        buf.extend(&wire);
        let frame = buf.next_frame().unwrap();
        assert_eq!(frame.opcode, CONTROL_BLOCK);
        assert_eq!(frame.payload, vec![0x34, 0x12]);
    }

    #[test]
    fn reassembly_is_chunk_boundary_independent() {
        let mut wire = Frame::new(0x7001, Direction::FromClient, vec![1, 2, 3]).to_wire();
        wire.extend(Frame::new(0x7002, Direction::FromServerEncrypted, vec![]).to_wire());
        wire.extend(Frame::control(CONTROL_UNBLOCK, 0xBEEF).to_wire());

        let mut whole = FrameBuffer::new();
        whole.extend(&wire);
        let expected = drain_all(&mut whole);
        assert_eq!(expected.len(), 3);

        // Same bytes delivered one at a time.
        let mut trickle = FrameBuffer::new();
        let mut got = Vec::new();
        for byte in &wire {
            trickle.extend(std::slice::from_ref(byte));
            got.extend(drain_all(&mut trickle));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn short_buffer_yields_nothing() {
        let wire = Frame::new(0x7001, Direction::FromServer, vec![0; 16]).to_wire();
        let mut buf = FrameBuffer::new();
        buf.extend(&wire[..wire.len() - 1]);
        assert!(buf.next_frame().is_none());
        buf.extend(&wire[wire.len() - 1..]);
        assert!(buf.next_frame().is_some());
    }

    #[test]
    fn trailing_partial_frame_survives_extraction() {
        let first = Frame::new(0x10, Direction::FromClient, vec![5; 4]).to_wire();
        let second = Frame::new(0x20, Direction::FromClient, vec![6; 4]).to_wire();
        let mut buf = FrameBuffer::new();
        buf.extend(&first);
        buf.extend(&second[..3]);

        assert_eq!(buf.next_frame().unwrap().opcode, 0x10);
        assert!(buf.next_frame().is_none());
        buf.extend(&second[3..]);
        assert_eq!(buf.next_frame().unwrap().opcode, 0x20);
    }

    #[test]
    fn direction_tags_map_both_ways() {
        for value in 1..=4u8 {
            let direction = Direction::from_wire(value).unwrap();
            assert_eq!(direction as u8, value);
        }
        assert!(Direction::from_wire(0).is_none());
        assert!(Direction::from_wire(5).is_none());

        assert!(Direction::from_client(true).is_encrypted());
        assert!(Direction::from_client(false).is_client_leg());
        assert!(!Direction::from_server(true).is_client_leg());
    }
}
