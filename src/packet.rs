//! The decoded application message exchanged between the two legs.

/// One decoded game message.
///
/// A packet is exclusively owned by whichever component currently processes
/// it: the relay engine during the pump, the fan-out while mirroring. It is
/// never shared mutably across the two secure channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 16-bit message identifier.
    pub opcode: u16,
    /// Opaque message body.
    pub payload: Vec<u8>,
    /// Was (or should be) this message protocol-encrypted on the wire.
    pub encrypted: bool,
    /// Does this message use the codec's multi-message batching mode.
    pub massive: bool,
}

impl Packet {
    pub fn new(opcode: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            payload,
            encrypted: false,
            massive: false,
        }
    }

    pub fn encrypted(opcode: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            payload,
            encrypted: true,
            massive: false,
        }
    }
}
