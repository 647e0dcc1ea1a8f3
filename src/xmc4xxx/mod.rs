// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! XMC4000 internal flash.
//!
//! The flash controller is driven through command sequences written to magic
//! addresses in the flash address space. Erase and protection commands are
//! issued directly from the host; page writes are issued by a small routine
//! running on the target, fed with data through a buffer in target RAM.

use std::time::Duration;
use indicatif::{ProgressBar, ProgressStyle};
use crate::target::Target;

pub mod layout;
pub mod command;
pub mod status;
pub mod protection;
pub mod writer;
pub mod loader;
pub mod info;

pub use layout::FlashController;
pub use protection::{UserLevel, Passwords, Protection};
pub use status::FlashStatus;
pub use writer::BlockWriteConfig;
pub use info::DeviceInfo;

use command::CommandSequence;
use loader::PAGE_SIZE;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Target is not halted.")]
    NotHalted,
    #[error("Unsupported flash controller ID 0x{0:02X}.")]
    UnsupportedDevice(u32),
    #[error("Chip ID 0x{0:08X} does not belong to an XMC4000 device.")]
    UnknownFamily(u32),
    #[error("Flash bank has not been probed.")]
    NotProbed,
    #[error("Invalid sector range {first}..={last}, device has {count} sectors.")]
    InvalidSector { first: usize, last: usize, count: usize },
    #[error("Invalid user level {0}.")]
    InvalidUserLevel(u32),
    #[error("Flash controller reported a command sequence error.")]
    SequenceError,
    #[error("Flash controller did not start erasing.")]
    EraseNotStarted,
    #[error("Flash controller reported a protection error.")]
    ProtectionViolation,
    #[error("Protection is already installed for user level {0} and must be removed first.")]
    AlreadyProtected(u32),
    #[error("Invalid protection request: {0}.")]
    InvalidProtectionRequest(String),
    #[error("Flash passwords not set.")]
    PasswordsNotSet,
    #[error("Unable to temporarily disable flash protection.")]
    TemporaryUnprotectFailed,
    #[error("Timed out waiting for flash.")]
    Timeout,
    #[error("Not enough working area: need {needed} bytes, {available} available.")]
    ResourceExhausted { needed: u32, available: u32 },
    #[error("Access of {length} bytes at offset 0x{offset:X} is outside the flash bank.")]
    OutOfBounds { offset: u32, length: usize },
    #[error("Offset 0x{0:X} is not aligned to a flash page.")]
    Unaligned(u32),
    #[error("Flash writer routine aborted.")]
    TargetAborted,
    #[error("Flash writer routine reported an invalid read pointer 0x{0:08X}.")]
    CorruptReadPointer(u32),
    #[error("Mismatch during flash readback verification at offset 0x{0:X}.")]
    ReadbackError(u32),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Uncached alias of the program flash.
pub const FLASH_BASE: u32 = 0x0C00_0000;

/// Erased flash reads as zero.
pub const ERASED_VALUE: u8 = 0x00;

/// Default number of 1ms status polls before giving up.
pub const DEFAULT_TIMEOUT: u32 = 5000;

const DATA_PROGRESS_TPL: &str =
    " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
const DATA_PROGRESS_CHARS: &str = "=> ";
const SECTOR_PROGRESS_TPL: &str = " {msg} [{bar:40}] {pos}/{len} sectors ({elapsed})";

fn progress_style(template: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(template)
        .map_err(anyhow::Error::from)?
        .progress_chars(DATA_PROGRESS_CHARS))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sector {
    /// Offset from the bank base.
    pub offset: u32,
    pub size: u32,
    /// None until read by `protect_check`.
    pub is_protected: Option<bool>,
    /// None until erased.
    pub is_erased: Option<bool>,
}

/// Flash bank geometry and recorded state.
#[derive(Clone, Debug)]
pub struct Bank {
    pub base: u32,
    pub size: u32,
    pub sectors: Vec<Sector>,
    pub controller: Option<FlashController>,
    pub protection: Protection,
}

impl Bank {
    pub fn new(base: u32) -> Self {
        Bank {
            base,
            size: 0,
            sectors: Vec::new(),
            controller: None,
            protection: Protection::default(),
        }
    }

    pub fn is_probed(&self) -> bool {
        self.controller.is_some()
    }

    pub fn erased_value(&self) -> u8 {
        ERASED_VALUE
    }

    fn controller(&self) -> Result<FlashController> {
        self.controller.ok_or(Error::NotProbed)
    }

    fn check_sectors(&self, first: usize, last: usize) -> Result<()> {
        let count = self.sectors.len();
        if first > last || last >= count {
            log::error!("Invalid sector range {}..={}", first, last);
            return Err(Error::InvalidSector { first, last, count });
        }
        Ok(())
    }

    fn check_range(&self, offset: u32, length: usize) -> Result<()> {
        if offset as u64 + length as u64 > self.size as u64 {
            log::error!("Attempting to access past the end of flash");
            return Err(Error::OutOfBounds { offset, length });
        }
        Ok(())
    }
}

/// XMC4000 flash bank on a target.
pub struct Flash<'a, T: Target> {
    target: &'a mut T,
    bank: Bank,

    /// Status polls allowed for erase operations.
    timeout: u32,

    block_write: BlockWriteConfig,
}

impl<'a, T: Target> Flash<'a, T> {
    /// Create a new Flash instance for the bank at the default base address.
    pub fn new(target: &'a mut T) -> Self {
        Flash {
            target,
            bank: Bank::new(FLASH_BASE),
            timeout: DEFAULT_TIMEOUT,
            block_write: BlockWriteConfig::default(),
        }
    }

    /// Use a different bank base address, for example the cached flash alias.
    ///
    /// Any probed geometry is discarded.
    pub fn set_base(&mut self, base: u32) {
        self.bank = Bank::new(base);
    }

    pub fn bank(&self) -> &Bank {
        &self.bank
    }

    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    /// Set the number of 1ms polls allowed for each erase.
    pub fn set_timeout(&mut self, polls: u32) {
        self.timeout = polls;
    }

    /// Set the smallest working area buffer a block write will accept.
    pub fn set_min_buffer(&mut self, bytes: u32) {
        self.block_write.min_buffer = bytes;
    }

    /// Set the largest buffer a block write will use.
    pub fn set_max_buffer(&mut self, bytes: u32) {
        self.block_write.max_buffer = bytes;
    }

    /// Set how long to wait for the writer routine to finish.
    pub fn set_algorithm_timeout(&mut self, timeout: Duration) {
        self.block_write.algorithm_timeout = timeout;
    }

    pub fn set_passwords(&mut self, pw1: u32, pw2: u32) {
        log::info!("Flash passwords set to 0x{:08X} 0x{:08X}", pw1, pw2);
        self.bank.protection.passwords = Some(Passwords { pw1, pw2 });
    }

    pub fn clear_passwords(&mut self) {
        self.bank.protection.passwords = None;
    }

    fn check_halted(&mut self) -> Result<()> {
        if self.target.is_halted()? {
            Ok(())
        } else {
            log::warn!("Cannot communicate, target not halted.");
            Err(Error::NotHalted)
        }
    }

    /// Identify the device and load its sector layout.
    ///
    /// Does nothing if the bank is already probed.
    pub fn probe(&mut self) -> Result<()> {
        if self.bank.is_probed() {
            return Ok(());
        }
        self.check_halted()?;

        let chip_id = self.target.read_u32(layout::SCU_IDCHIP)?;
        if !layout::is_xmc4000(chip_id) {
            log::error!("Chip ID doesn't match XMC4xxx: 0x{:08X}", chip_id);
            return Err(Error::UnknownFamily(chip_id));
        }
        log::debug!("Found XMC4xxx with chip ID 0x{:08X}", chip_id);

        let flash_id = self.target.read_u32(layout::FLASH_ID)?;
        let controller = match FlashController::from_register(flash_id) {
            Some(controller) => controller,
            None => {
                let id = (flash_id >> 16) & 0xFF;
                log::error!("Unexpected flash controller ID 0x{:02X}", id);
                return Err(Error::UnsupportedDevice(id));
            },
        };
        log::debug!("{} flash controller detected", controller.devices());

        let sectors = controller.sectors();
        for (i, sector) in sectors.iter().enumerate() {
            log::trace!("Sector {}: {}k at 0x{:06X}", i, sector.size / 1024, sector.offset);
        }
        self.bank.size = controller.total_size();
        self.bank.protection.otp = vec![false; sectors.len()];
        self.bank.protection.read_protected = false;
        self.bank.sectors = sectors;
        self.bank.controller = Some(controller);
        Ok(())
    }

    /// Describe the device, including any recorded read and OTP protection.
    pub fn get_info(&mut self) -> Result<String> {
        self.check_halted()?;
        let chip_id = self.target.read_u32(layout::SCU_IDCHIP)?;
        Ok(info::describe(chip_id, &self.bank.protection))
    }

    /// Erase sectors `first` to `last` inclusive.
    pub fn erase(&mut self, first: usize, last: usize) -> Result<()> {
        self.erase_cb(first, last, |_| {})
    }

    /// Erase every sector.
    pub fn erase_all(&mut self) -> Result<()> {
        self.probe()?;
        let last = self.bank.sectors.len() - 1;
        self.erase(0, last)
    }

    /// Erase sectors `first` to `last` inclusive, drawing a progress bar.
    pub fn erase_progress(&mut self, first: usize, last: usize) -> Result<()> {
        let count = last.saturating_sub(first) + 1;
        let pb = ProgressBar::new(count as u64).with_style(progress_style(SECTOR_PROGRESS_TPL)?);
        pb.set_message("Erasing");
        let result = self.erase_cb(first, last, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Erase sectors `first` to `last` inclusive.
    ///
    /// `cb` is called with the number of sectors erased so far. Flash status
    /// is cleared afterwards whether or not the erase succeeded.
    pub fn erase_cb<F: FnMut(usize)>(&mut self, first: usize, last: usize, mut cb: F)
        -> Result<()>
    {
        self.check_halted()?;
        self.probe()?;
        self.bank.check_sectors(first, last)?;

        let mut result = Ok(());
        for i in first..=last {
            let address = self.bank.base + self.bank.sectors[i].offset;
            log::debug!("Erasing sector {} at 0x{:08X}", i, address);
            result = self.erase_at(CommandSequence::erase_sector(address));
            if result.is_err() {
                break;
            }
            self.bank.sectors[i].is_erased = Some(true);
            cb(i - first + 1);
        }

        if let Err(e) = status::clear_status(self.target) {
            log::warn!("Could not clear flash status after erase: {}", e);
        }
        result
    }

    /// Run an erase sequence and wait for it to finish.
    fn erase_at(&mut self, sequence: CommandSequence) -> Result<()> {
        sequence.write(self.target)?;
        let status = status::read_status(self.target)?;
        if status.get_sqer() {
            log::error!("Error with flash erase sequence ({})", status);
            return Err(Error::SequenceError);
        }
        if !status.get_erase() {
            log::error!("Flash failed to erase ({})", status);
            return Err(Error::EraseNotStarted);
        }
        status::wait_while_busy(self.target, self.timeout)?;
        Ok(())
    }

    /// Read `length` bytes from `offset` within the bank.
    pub fn read(&mut self, offset: u32, length: usize) -> Result<Vec<u8>> {
        self.check_halted()?;
        self.probe()?;
        self.bank.check_range(offset, length)?;
        let mut data = vec![0u8; length];
        self.target.read_memory(self.bank.base + offset, &mut data)?;
        Ok(data)
    }

    /// Read `length` bytes from `offset`, drawing a progress bar.
    pub fn read_progress(&mut self, offset: u32, length: usize) -> Result<Vec<u8>> {
        let pb = ProgressBar::new(length as u64).with_style(progress_style(DATA_PROGRESS_TPL)?);
        pb.set_message("Reading");
        let mut data = Vec::with_capacity(length);
        for chunk in (0..length).step_by(PAGE_SIZE as usize * 16) {
            let n = (length - chunk).min(PAGE_SIZE as usize * 16);
            data.extend(self.read(offset + chunk as u32, n)?);
            pb.set_position(data.len() as u64);
        }
        pb.finish();
        Ok(data)
    }

    /// Check flash contents at `offset` match `data`.
    pub fn verify(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let programmed = self.read(offset, data.len())?;
        match programmed.iter().zip(data).position(|(a, b)| a != b) {
            None => Ok(()),
            Some(i) => {
                log::error!("Readback verification failed. Check flash protection.");
                Err(Error::ReadbackError(offset + i as u32))
            },
        }
    }

    /// Write `data` to the bank at `offset`, which must be page aligned.
    ///
    /// The target sectors must already be erased. A partial final page is
    /// padded with the erased value.
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.write_cb(offset, data, |_| {})
    }

    /// Write `data` to the bank at `offset`, drawing a progress bar.
    pub fn write_progress(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let pb = ProgressBar::new(data.len() as u64).with_style(progress_style(DATA_PROGRESS_TPL)?);
        pb.set_message("Writing");
        let len = data.len();
        let result = self.write_cb(offset, data, |n| pb.set_position(n.min(len) as u64));
        pb.finish();
        result
    }

    /// Write `data` to the bank at `offset`, calling `cb` with the number of
    /// bytes handed to the target so far.
    pub fn write_cb<F: FnMut(usize)>(&mut self, offset: u32, data: &[u8], cb: F) -> Result<()> {
        self.check_halted()?;
        self.probe()?;
        if offset % PAGE_SIZE != 0 {
            log::error!("Write offset 0x{:X} is not page aligned", offset);
            return Err(Error::Unaligned(offset));
        }
        let padded = pad_to_page(data, ERASED_VALUE);
        self.bank.check_range(offset, padded.len())?;
        if padded.is_empty() {
            return Ok(());
        }
        if padded.len() != data.len() {
            log::debug!("Padding write with {} bytes", padded.len() - data.len());
        }
        let address = self.bank.base + offset;
        writer::write_block(self.target, address, &padded, &self.block_write, cb)
    }

    /// Read PROCON registers and record sector, OTP and read protection.
    ///
    /// Has no effect on the hardware.
    pub fn protect_check(&mut self) -> Result<()> {
        self.check_halted()?;
        self.probe()?;
        let controller = self.bank.controller()?;
        let mut procon = [0u32; 3];
        for (value, &address) in procon.iter_mut().zip(protection::PROCON.iter()) {
            *value = self.target.read_u32(address)?;
        }
        log::debug!("PROCON0=0x{:08X} PROCON1=0x{:08X} PROCON2=0x{:08X}",
                    procon[0], procon[1], procon[2]);
        let map = protection::decode_procon(controller, procon);
        for (sector, &protected) in self.bank.sectors.iter_mut().zip(map.protected.iter()) {
            sector.is_protected = Some(protected);
        }
        self.bank.protection.otp = map.otp;
        self.bank.protection.read_protected = map.read_protected;
        Ok(())
    }

    /// Install User0 write protection on sectors `first` to `last` when
    /// `enable` is set, otherwise disable User0 protection until the next reset.
    pub fn protect(&mut self, enable: bool, first: usize, last: usize) -> Result<()> {
        self.bank.protection.passwords()?;
        if enable {
            self.protect_level(UserLevel::User0, false, first, last)
        } else {
            log::warn!("Flash protection will be temporarily disabled for all sectors (User 0 only)");
            self.temporary_unprotect(UserLevel::User0)
        }
    }

    /// Install write protection for `level` on sectors `first` to `last`,
    /// with read protection if `read_protect` is set (User0 only).
    ///
    /// The configuration only takes effect after a reset; check with
    /// `protect_check`. User2 protection can never be removed.
    pub fn protect_level(&mut self, level: UserLevel, read_protect: bool,
                         first: usize, last: usize) -> Result<()>
    {
        let passwords = self.bank.protection.passwords()?;
        if read_protect && level != UserLevel::User0 {
            log::error!("Read protection is for user level 0 only");
            return Err(Error::InvalidProtectionRequest(
                "read protection is only available for user level 0".to_string()));
        }
        self.check_halted()?;
        self.probe()?;
        self.bank.check_sectors(first, last)?;
        let controller = self.bank.controller()?;

        let status = status::read_status(self.target)?;
        if level.is_installed(status) {
            log::error!("Flash protection is installed for user {} and must be removed first",
                        level.index());
            return Err(Error::AlreadyProtected(level.index()));
        }

        let procon = protection::encode_procon(controller, first, last, read_protect)?;
        log::debug!("Setting flash protection with PROCON 0x{:08X}", procon);
        if level == UserLevel::User2 {
            log::warn!("User 2 protection is permanent");
        }

        let ucb = protection::ucb_image(procon, passwords);
        let bytes: Vec<u8> = ucb.iter().flat_map(|w| w.to_le_bytes()).collect();
        let padded = pad_to_page(&bytes, ERASED_VALUE);
        let address = self.bank.base + level.ucb_offset();
        writer::write_block(self.target, address, &padded, &self.block_write, |_| {})
            .map_err(|e| {
                log::error!("Error writing user configuration block {}", level.index());
                e
            })
    }

    /// Disable write protection for `level` until the next reset.
    pub fn temporary_unprotect(&mut self, level: UserLevel) -> Result<()> {
        let passwords = self.bank.protection.passwords()?;
        self.check_halted()?;
        let seq = CommandSequence::temporary_unprotect(level.index(), passwords.pw1, passwords.pw2);
        seq.write(self.target)?;
        let status = status::read_status(self.target)?;
        if status.get_wprodis(0) {
            log::info!("Flash is temporarily unprotected");
            Ok(())
        } else {
            log::info!("Unable to disable flash protection ({})", status);
            Err(Error::TemporaryUnprotectFailed)
        }
    }

    /// Permanently remove protection for user level 0 or 1 by erasing its
    /// user configuration block.
    ///
    /// Each UCB survives a limited number of erase cycles, so this must not
    /// be repeated needlessly.
    pub fn flash_unprotect(&mut self, level: u32) -> Result<()> {
        let level = match UserLevel::from_index(level)? {
            UserLevel::User2 => {
                log::error!("Invalid user level. Must be 0-1");
                return Err(Error::InvalidUserLevel(2));
            },
            level => level,
        };
        self.check_halted()?;
        log::warn!("Erasing user configuration block {}; this uses one of its limited erase cycles",
                   level.index());
        let address = self.bank.base + level.ucb_offset();
        let result = self.erase_at(CommandSequence::erase_ucb(address));
        if let Err(e) = status::clear_status(self.target) {
            log::warn!("Could not clear flash status after erase: {}", e);
        }
        result.map_err(|e| {
            log::error!("Error erasing user configuration block");
            e
        })
    }
}

/// Pad `data` up to a whole number of pages with `value`.
fn pad_to_page(data: &[u8], value: u8) -> Vec<u8> {
    let page = PAGE_SIZE as usize;
    let len = (data.len() + page - 1) / page * page;
    let mut padded = data.to_vec();
    padded.resize(len, value);
    padded
}

#[test]
fn test_pad_to_page() {
    assert!(pad_to_page(&[], 0).is_empty());
    let padded = pad_to_page(&[1, 2, 3], 0);
    assert_eq!(padded.len(), 256);
    assert_eq!(&padded[..4], &[1, 2, 3, 0]);
    assert_eq!(pad_to_page(&[7; 256], 0).len(), 256);
    assert_eq!(pad_to_page(&[7; 257], 0).len(), 512);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimTarget, RAM_BASE};
    use command::{ADDR_5554, ADDR_AAA8, ADDR_553C, ADDR_5558};

    const CLEAR_STATUS: (u32, u32) = (ADDR_5554, 0xF5);

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8 + 1).collect()
    }

    fn erase_seq(address: u32, select: u32) -> Vec<(u32, u32)> {
        vec![(ADDR_5554, 0xAA), (ADDR_AAA8, 0x55), (ADDR_5554, 0x80),
             (ADDR_5554, 0xAA), (ADDR_AAA8, 0x55), (address, select)]
    }

    #[test]
    fn test_probe() {
        let mut sim = SimTarget::new(FlashController::Sectors12);
        let mut flash = Flash::new(&mut sim);
        flash.probe().unwrap();
        flash.probe().unwrap();
        let bank = flash.bank();
        assert_eq!(bank.sectors.len(), 12);
        assert_eq!(bank.size, 1024 * 1024);
        assert_eq!(bank.sectors[9].offset, 256 * 1024);
        assert_eq!(bank.protection.otp.len(), 12);
        assert_eq!(bank.erased_value(), 0x00);
    }

    #[test]
    fn test_probe_unknown_controller() {
        let mut sim = SimTarget::new(FlashController::Sectors12);
        sim.set_flash_id(0xAB);
        let mut flash = Flash::new(&mut sim);
        assert!(matches!(flash.probe(), Err(Error::UnsupportedDevice(0xAB))));
        assert!(!flash.bank().is_probed());
        assert!(flash.bank().sectors.is_empty());
    }

    #[test]
    fn test_probe_unknown_family() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.set_chip_id(0x0001_3001);
        let mut flash = Flash::new(&mut sim);
        assert!(matches!(flash.probe(), Err(Error::UnknownFamily(0x0001_3001))));
        assert!(!flash.bank().is_probed());
    }

    #[test]
    fn test_not_halted() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.set_halted(false);
        let mut flash = Flash::new(&mut sim);
        assert!(matches!(flash.probe(), Err(Error::NotHalted)));
        assert!(matches!(flash.erase(0, 0), Err(Error::NotHalted)));
        assert!(matches!(flash.write(0, &[0; 8]), Err(Error::NotHalted)));
    }

    #[test]
    fn test_erase_sector() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        for b in &mut sim.flash_mut()[0x4000..0x8000] {
            *b = 0xFF;
        }
        {
            let mut flash = Flash::new(&mut sim);
            flash.erase(1, 1).unwrap();
            assert_eq!(flash.bank().sectors[1].is_erased, Some(true));
            assert_eq!(flash.bank().sectors[0].is_erased, None);
        }
        assert!(sim.flash()[0x4000..0x8000].iter().all(|&b| b == 0));
        assert_eq!(sim.bus.sector_erases, vec![0x0C00_4000]);
        let mut expected = erase_seq(0x0C00_4000, 0x30);
        expected.push(CLEAR_STATUS);
        assert_eq!(sim.host_writes, expected);
    }

    #[test]
    fn test_erase_all() {
        let mut sim = SimTarget::new(FlashController::Sectors9);
        Flash::new(&mut sim).erase_all().unwrap();
        assert_eq!(sim.bus.sector_erases.len(), 9);
        assert_eq!(sim.bus.sector_erases[8], 0x0C00_0000 + 240 * 1024);
    }

    #[test]
    fn test_erase_invalid_sector() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        let mut flash = Flash::new(&mut sim);
        assert!(matches!(flash.erase(3, 2), Err(Error::InvalidSector { .. })));
        assert!(matches!(flash.erase(0, 8), Err(Error::InvalidSector { count: 8, .. })));
    }

    #[test]
    fn test_erase_protected_sector() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.set_procon([1 << 1, 0, 0]);
        {
            let mut flash = Flash::new(&mut sim);
            assert!(matches!(flash.erase(1, 2), Err(Error::EraseNotStarted)));
            assert_eq!(flash.bank().sectors[1].is_erased, None);
            assert_eq!(flash.bank().sectors[2].is_erased, None);
        }
        // Status is still cleared after the failure.
        assert_eq!(sim.host_writes.last(), Some(&CLEAR_STATUS));
        assert_eq!(sim.status_bits() & (1 << 11), 0);
        assert!(sim.bus.sector_erases.is_empty());
    }

    #[test]
    fn test_erase_sequence_error() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.inject_sequence_error();
        assert!(matches!(Flash::new(&mut sim).erase(0, 0), Err(Error::SequenceError)));
        assert_eq!(sim.host_writes.last(), Some(&CLEAR_STATUS));
    }

    #[test]
    fn test_erase_timeout() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.set_stuck_busy(true);
        {
            let mut flash = Flash::new(&mut sim);
            flash.set_timeout(10);
            assert!(matches!(flash.erase(0, 0), Err(Error::Timeout)));
        }
        assert_eq!(sim.sleeps, 10);
    }

    #[test]
    fn test_write() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        let data = pattern(1000);
        let mut progress = 0;
        Flash::new(&mut sim).write_cb(0x4000, &data, |n| progress = n).unwrap();
        assert_eq!(progress, 1024);
        assert_eq!(&sim.flash()[0x4000..0x4000 + 1000], &data[..]);
        assert!(sim.flash()[0x4000 + 1000..0x4400].iter().all(|&b| b == 0));
        assert_eq!(sim.bus.page_writes, vec![0x0C00_4000, 0x0C00_4100, 0x0C00_4200, 0x0C00_4300]);
        assert_eq!(sim.units_written(), 128);
        assert_eq!(sim.working_area().available(), 0x4000);
        assert_eq!(sim.host_writes.last(), Some(&CLEAR_STATUS));

        let params = sim.last_params.unwrap();
        assert_eq!(params.args[2], 0x0C00_4000);
        assert_eq!(params.args[3], 128);
        assert_eq!(params.stack_pointer, params.args[0] + 100);
    }

    #[test]
    fn test_write_small_buffer_wraps() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        // Routine code, the work area header and 64 bytes of buffer.
        sim.set_working_area(128 + 108 + 64);
        sim.set_steps_per_access(1);
        let data = pattern(1024);
        {
            let mut flash = Flash::new(&mut sim);
            flash.set_min_buffer(64);
            flash.write(0, &data).unwrap();
        }
        assert_eq!(&sim.flash()[..1024], &data[..]);
        assert_eq!(sim.bus.page_writes.len(), 4);
        assert_eq!(sim.units_written(), 128);
        let params = sim.last_params.unwrap();
        assert_eq!(params.args[1] - params.args[0], 108 + 64);
    }

    #[test]
    fn test_write_target_abort() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.set_working_area(128 + 108 + 64);
        sim.set_steps_per_access(1);
        sim.abort_after(Some(10));
        {
            let mut flash = Flash::new(&mut sim);
            flash.set_min_buffer(64);
            assert!(matches!(flash.write(0, &pattern(1024)), Err(Error::TargetAborted)));
        }
        assert_eq!(sim.units_written(), 10);
        assert_eq!(sim.working_area().available(), 128 + 108 + 64);
        assert_eq!(sim.host_writes.last(), Some(&CLEAR_STATUS));

        // The host cleared its write pointer to cancel the routine.
        let wp_cell = sim.last_params.unwrap().args[0] + 100 - RAM_BASE;
        let wp = &sim.ram()[wp_cell as usize..wp_cell as usize + 4];
        assert_eq!(wp, &[0, 0, 0, 0]);
    }

    #[test]
    fn test_write_abort_after_last_push() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.abort_after(Some(40));
        assert!(matches!(Flash::new(&mut sim).write(0, &pattern(512)), Err(Error::TargetAborted)));
        assert_eq!(sim.working_area().available(), 0x4000);
    }

    #[test]
    fn test_write_stalled_controller() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.set_working_area(128 + 108 + 256);
        sim.set_stuck_busy(true);
        {
            let mut flash = Flash::new(&mut sim);
            flash.set_algorithm_timeout(Duration::from_millis(10));
            assert!(matches!(flash.write(0, &[0x5A; 2048]), Err(Error::Timeout)));
        }
        assert!(sim.sleeps >= 10);
        assert!(sim.is_halted().unwrap());
        assert_eq!(sim.working_area().available(), 128 + 108 + 256);
        assert_eq!(sim.host_writes.last(), Some(&CLEAR_STATUS));

        let wp_cell = (sim.last_params.unwrap().args[0] + 100 - RAM_BASE) as usize;
        assert_eq!(&sim.ram()[wp_cell..wp_cell + 4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_write_protected_sector() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.set_procon([1, 0, 0]);
        let result = Flash::new(&mut sim).write(0, &[0xA5; 256]);
        assert!(matches!(result, Err(Error::ProtectionViolation)));
        assert!(sim.bus.page_writes.is_empty());
        assert_eq!(sim.flash()[0], 0);
        assert_eq!(sim.status_bits() & (1 << 11), 0);
        assert_eq!(sim.working_area().available(), 0x4000);
    }

    #[test]
    fn test_write_sequence_error() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.inject_sequence_error();
        let result = Flash::new(&mut sim).write(0, &[0xA5; 256]);
        assert!(matches!(result, Err(Error::SequenceError)));
        assert!(sim.bus.page_writes.is_empty());
        assert_eq!(sim.host_writes.last(), Some(&CLEAR_STATUS));
    }

    #[test]
    fn test_write_lost_connection() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.fail_next_wait();
        let result = Flash::new(&mut sim).write(0, &pattern(2048));
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(sim.is_halted().unwrap());
        assert!(sim.units_written() < 256);
        assert_eq!(sim.working_area().available(), 0x4000);
    }

    #[test]
    fn test_write_no_working_area() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.set_working_area(200);
        let result = Flash::new(&mut sim).write(0, &pattern(256));
        assert!(matches!(result, Err(Error::ResourceExhausted { .. })));
        assert_eq!(sim.working_area().available(), 200);
        assert!(sim.bus.page_writes.is_empty());
    }

    #[test]
    fn test_write_alignment_and_bounds() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        let mut flash = Flash::new(&mut sim);
        assert!(matches!(flash.write(0x10, &[1; 16]), Err(Error::Unaligned(0x10))));
        let end = 240 * 1024;
        assert!(matches!(flash.write(end - 256, &[1; 512]), Err(Error::OutOfBounds { .. })));
        assert!(matches!(flash.read(end - 4, 8), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn test_read_verify() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.flash_mut()[0x100..0x104].copy_from_slice(&[1, 2, 3, 4]);
        let mut flash = Flash::new(&mut sim);
        assert_eq!(flash.read(0x100, 4).unwrap(), vec![1, 2, 3, 4]);
        flash.verify(0x100, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(flash.verify(0x100, &[1, 2, 9, 4]), Err(Error::ReadbackError(0x102))));
    }

    #[test]
    fn test_protect_check() {
        let mut sim = SimTarget::new(FlashController::Sectors12);
        sim.set_procon([(1 << 10) | 1 | protection::PROCON_RPRO, 0, 1 << 3]);
        let mut flash = Flash::new(&mut sim);
        flash.protect_check().unwrap();
        let first = flash.bank().clone();
        flash.protect_check().unwrap();
        assert_eq!(flash.bank().sectors, first.sectors);
        assert_eq!(flash.bank().protection.otp, first.protection.otp);

        let protected: Vec<usize> = first.sectors.iter().enumerate()
            .filter(|(_, s)| s.is_protected == Some(true)).map(|(i, _)| i).collect();
        assert_eq!(protected, vec![0, 3, 10, 11]);
        assert_eq!(first.protection.otp_sectors(), vec![3]);
        assert!(first.protection.read_protected);

        let info = flash.get_info().unwrap();
        assert_eq!(info, "XMC4500 - Rev: AC\nFlash is read protected\n\
                          OTP Protection is enabled for sectors:\n- 3");
    }

    #[test]
    fn test_protect_install() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        {
            let mut flash = Flash::new(&mut sim);
            flash.set_passwords(0x1111_1111, 0x2222_2222);
            flash.protect(true, 1, 2).unwrap();
        }
        assert_eq!(sim.bus.page_writes, vec![0x0C00_0000]);
        let ucb: Vec<u32> = sim.flash()[..32].chunks(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]])).collect();
        assert_eq!(ucb, vec![
            protection::CONFIRMATION_CODE, 0, protection::CONFIRMATION_CODE, 0,
            0x1111_1111, 0x2222_2222, 0x1111_1111, 0x2222_2222,
        ]);
        assert!(sim.flash()[32..256].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_protect_level_ucb_address() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        {
            let mut flash = Flash::new(&mut sim);
            flash.set_passwords(1, 2);
            flash.protect_level(UserLevel::User2, false, 0, 0).unwrap();
        }
        assert_eq!(sim.bus.page_writes, vec![0x0C00_0800]);
    }

    #[test]
    fn test_protect_already_installed() {
        for &bits in &[1u32 << 21, 1 << 18] {
            let mut sim = SimTarget::new(FlashController::Sectors8);
            sim.set_status_bits(bits);
            {
                let mut flash = Flash::new(&mut sim);
                flash.set_passwords(1, 2);
                let result = flash.protect(true, 0, 0);
                assert!(matches!(result, Err(Error::AlreadyProtected(0))));
            }
            assert!(sim.host_writes.is_empty());
            assert_eq!(sim.memory_writes, 0);
        }
    }

    #[test]
    fn test_protect_requests() {
        let mut sim = SimTarget::new(FlashController::Sectors16);
        {
            let mut flash = Flash::new(&mut sim);
            assert!(matches!(flash.protect(true, 0, 0), Err(Error::PasswordsNotSet)));
            assert!(matches!(flash.protect(false, 0, 0), Err(Error::PasswordsNotSet)));
            flash.set_passwords(1, 2);
            assert!(matches!(flash.protect_level(UserLevel::User1, true, 0, 0),
                             Err(Error::InvalidProtectionRequest(_))));
            assert!(matches!(flash.protect_level(UserLevel::User0, false, 14, 15),
                             Err(Error::InvalidProtectionRequest(_))));
            flash.clear_passwords();
            assert!(matches!(flash.protect(true, 0, 0), Err(Error::PasswordsNotSet)));
        }
        assert!(sim.host_writes.is_empty());
        assert_eq!(sim.memory_writes, 0);
    }

    #[test]
    fn test_temporary_unprotect() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.set_passwords(0xAAAA_0000, 0x0000_5555);
        {
            let mut flash = Flash::new(&mut sim);
            flash.set_passwords(0xAAAA_0000, 0x0000_5555);
            flash.protect(false, 0, 0).unwrap();
        }
        assert_eq!(sim.host_writes, vec![
            (ADDR_5554, 0xAA), (ADDR_AAA8, 0x55), (ADDR_553C, 0),
            (ADDR_AAA8, 0xAAAA_0000), (ADDR_AAA8, 0x0000_5555), (ADDR_5558, 0x05),
        ]);

        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.set_passwords(1, 2);
        let mut flash = Flash::new(&mut sim);
        flash.set_passwords(1, 3);
        assert!(matches!(flash.protect(false, 0, 0), Err(Error::TemporaryUnprotectFailed)));
    }

    #[test]
    fn test_flash_unprotect() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        {
            let mut flash = Flash::new(&mut sim);
            assert!(matches!(flash.flash_unprotect(2), Err(Error::InvalidUserLevel(2))));
            assert!(matches!(flash.flash_unprotect(5), Err(Error::InvalidUserLevel(5))));
            flash.flash_unprotect(1).unwrap();
        }
        assert_eq!(sim.bus.ucb_erases, vec![0x0C00_0400]);
        let mut expected = erase_seq(0x0C00_0400, 0xC0);
        expected.push(CLEAR_STATUS);
        assert_eq!(sim.host_writes, expected);
    }
}
