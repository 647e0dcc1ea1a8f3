//! Command sequences understood by the flash controller's command decoder.
//!
//! Every flash operation starts with an ordered series of writes to magic
//! addresses in the flash address space. The controller rejects a sequence
//! written out of order with a sequence error, so a sequence is built whole and
//! then written without any intervening reads.

use crate::target::Target;
use super::Result;

/// Command decoder addresses.
pub const ADDR_5554: u32 = 0x0C00_5554;
pub const ADDR_AAA8: u32 = 0x0C00_AAA8;
pub const ADDR_553C: u32 = 0x0C00_553C;
pub const ADDR_5558: u32 = 0x0C00_5558;
pub const ADDR_55F0: u32 = 0x0C00_55F0;
pub const ADDR_55F4: u32 = 0x0C00_55F4;

/// Final value of an erase sequence selecting a physical sector.
pub const ERASE_SECTOR: u32 = 0x30;
/// Final value of an erase sequence selecting a user configuration block.
pub const ERASE_UCB: u32 = 0xC0;

/// One write of a command sequence.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub address: u32,
    pub value: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SequenceKind {
    EraseSector,
    EraseUcb,
    TemporaryUnprotect,
    WritePage,
    ClearStatus,
    EnterPageMode,
    LoadPage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSequence {
    kind: SequenceKind,
    commands: Vec<Command>,
}

const fn cmd(address: u32, value: u32) -> Command {
    Command { address, value }
}

impl CommandSequence {
    fn new(kind: SequenceKind, commands: Vec<Command>) -> Self {
        CommandSequence { kind, commands }
    }

    /// Erase the physical sector starting at `address`.
    pub fn erase_sector(address: u32) -> Self {
        Self::new(SequenceKind::EraseSector, Self::erase(address, ERASE_SECTOR))
    }

    /// Erase the user configuration block at `address`.
    pub fn erase_ucb(address: u32) -> Self {
        Self::new(SequenceKind::EraseUcb, Self::erase(address, ERASE_UCB))
    }

    fn erase(address: u32, select: u32) -> Vec<Command> {
        vec![
            cmd(ADDR_5554, 0xAA),
            cmd(ADDR_AAA8, 0x55),
            cmd(ADDR_5554, 0x80),
            cmd(ADDR_5554, 0xAA),
            cmd(ADDR_AAA8, 0x55),
            cmd(address, select),
        ]
    }

    /// Disable protection for user `level` until the next reset.
    pub fn temporary_unprotect(level: u32, pw1: u32, pw2: u32) -> Self {
        Self::new(SequenceKind::TemporaryUnprotect, vec![
            cmd(ADDR_5554, 0xAA),
            cmd(ADDR_AAA8, 0x55),
            cmd(ADDR_553C, level),
            cmd(ADDR_AAA8, pw1),
            cmd(ADDR_AAA8, pw2),
            cmd(ADDR_5558, 0x05),
        ])
    }

    /// Commit the loaded page buffer to the page at `address`.
    pub fn write_page(address: u32) -> Self {
        Self::new(SequenceKind::WritePage, vec![
            cmd(ADDR_5554, 0xAA),
            cmd(ADDR_AAA8, 0x55),
            cmd(ADDR_5554, 0xA0),
            cmd(address, 0xAA),
        ])
    }

    pub fn clear_status() -> Self {
        Self::new(SequenceKind::ClearStatus, vec![cmd(ADDR_5554, 0xF5)])
    }

    pub fn enter_page_mode() -> Self {
        Self::new(SequenceKind::EnterPageMode, vec![cmd(ADDR_5554, 0x50)])
    }

    /// Load one flash word into the page assembly buffer.
    pub fn load_page(low: u32, high: u32) -> Self {
        Self::new(SequenceKind::LoadPage, vec![cmd(ADDR_55F0, low), cmd(ADDR_55F4, high)])
    }

    pub fn kind(&self) -> SequenceKind {
        self.kind
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Write each command in order, stopping at the first failed write.
    pub fn write<T: Target>(&self, target: &mut T) -> Result<()> {
        log::trace!("Writing {:?} sequence", self.kind);
        for command in &self.commands {
            target.write_u32(command.address, command.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(seq: &CommandSequence) -> Vec<(u32, u32)> {
        seq.commands().iter().map(|c| (c.address, c.value)).collect()
    }

    #[test]
    fn test_erase_sector() {
        let seq = CommandSequence::erase_sector(0x0C00_4000);
        assert_eq!(seq.kind(), SequenceKind::EraseSector);
        assert_eq!(pairs(&seq), vec![
            (0x0C00_5554, 0xAA), (0x0C00_AAA8, 0x55), (0x0C00_5554, 0x80),
            (0x0C00_5554, 0xAA), (0x0C00_AAA8, 0x55), (0x0C00_4000, 0x30),
        ]);
    }

    #[test]
    fn test_erase_ucb() {
        let seq = CommandSequence::erase_ucb(0x0C00_0400);
        assert_eq!(pairs(&seq)[5], (0x0C00_0400, 0xC0));
        assert_eq!(pairs(&seq)[..5], pairs(&CommandSequence::erase_sector(0))[..5]);
    }

    #[test]
    fn test_temporary_unprotect() {
        let seq = CommandSequence::temporary_unprotect(0, 0x1234_5678, 0x9ABC_DEF0);
        assert_eq!(pairs(&seq), vec![
            (0x0C00_5554, 0xAA), (0x0C00_AAA8, 0x55), (0x0C00_553C, 0x00),
            (0x0C00_AAA8, 0x1234_5678), (0x0C00_AAA8, 0x9ABC_DEF0), (0x0C00_5558, 0x05),
        ]);
    }

    #[test]
    fn test_write_page() {
        let seq = CommandSequence::write_page(0x0C00_0100);
        assert_eq!(pairs(&seq), vec![
            (0x0C00_5554, 0xAA), (0x0C00_AAA8, 0x55), (0x0C00_5554, 0xA0), (0x0C00_0100, 0xAA),
        ]);
    }
}
