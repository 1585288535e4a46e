//! Process-wide set of suppressed game opcodes.

use std::collections::HashSet;

/// Opcodes the pump silently drops in both directions.
///
/// Owned by the relay engine; mutated only via block/unblock control
/// frames from the auxiliary channel. There is no reset operation.
#[derive(Debug, Default)]
pub struct BlockSet {
    blocked: HashSet<u16>,
}

impl BlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&mut self, opcode: u16) {
        self.blocked.insert(opcode);
    }

    /// No-op if the opcode was never blocked.
    pub fn unblock(&mut self, opcode: u16) {
        self.blocked.remove(&opcode);
    }

    pub fn contains(&self, opcode: u16) -> bool {
        self.blocked.contains(&opcode)
    }
}
