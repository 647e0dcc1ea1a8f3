//! A simulated XMC4000 target.
//!
//! Models RAM, the program flash array, the flash controller's command decoder
//! and status/protection registers, and a core that can only run the flash
//! writer routine (executed by [`WriterRoutine`]). Used by the test suite and by
//! `xmcdap --sim` for dry runs without hardware.

use std::time::Duration;
use anyhow::{anyhow, bail};
use crate::target::{Target, AlgorithmParams, WorkingArea};
use crate::xmc4xxx::{FlashController, FLASH_BASE};
use crate::xmc4xxx::command::{ADDR_5554, ADDR_AAA8, ADDR_553C, ADDR_5558, ADDR_55F0, ADDR_55F4};
use crate::xmc4xxx::layout::{FLASH_ID, SCU_IDCHIP};
use crate::xmc4xxx::loader::{TargetBus, WriterRoutine, Step, WRITER_CODE, PAGE_SIZE, PAGE_WORDS};
use crate::xmc4xxx::protection::PROCON;
use crate::xmc4xxx::status::FSR;

pub const RAM_BASE: u32 = 0x2000_0000;
pub const RAM_SIZE: u32 = 0x1_0000;

const FSR_PBUSY: u32 = 1 << 0;
const FSR_PROG: u32 = 1 << 4;
const FSR_ERASE: u32 = 1 << 5;
const FSR_PFPAGE: u32 = 1 << 6;
const FSR_SQER: u32 = 1 << 10;
const FSR_PROER: u32 = 1 << 11;
const FSR_WPRODIS0: u32 = 1 << 25;
const FSR_WPRODIS1: u32 = 1 << 26;

/// Flags removed by the clear status command.
const FSR_CLEARABLE: u32 = FSR_PROG | FSR_ERASE | FSR_SQER | FSR_PROER;

/// Routine steps taken for each host access.
const DEFAULT_STEPS: usize = 8;

/// Routine steps allowed by `wait_algorithm` before reporting a timeout.
const WAIT_STEPS: usize = 1_000_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Decode {
    Incomplete,
    Invalid,
    Erase { address: u32, ucb: bool },
    TemporaryUnprotect { level: u32, pw1: u32, pw2: u32 },
    WritePage { address: u32 },
}

/// Classify a partial multi-cycle command sequence.
fn decode(seq: &[(u32, u32)]) -> Decode {
    let is = |i: usize, address: u32, value: u32| seq.get(i).map_or(true, |&c| c == (address, value));
    let at = |i: usize, address: u32| seq.get(i).map_or(true, |&(a, _)| a == address);
    if !is(0, ADDR_5554, 0xAA) || !is(1, ADDR_AAA8, 0x55) {
        return Decode::Invalid;
    }
    if seq.len() < 3 {
        return Decode::Incomplete;
    }
    match seq[2] {
        (ADDR_5554, 0x80) => {
            if !is(3, ADDR_5554, 0xAA) || !is(4, ADDR_AAA8, 0x55) {
                return Decode::Invalid;
            }
            match seq.get(5) {
                None => Decode::Incomplete,
                Some(&(address, 0x30)) => Decode::Erase { address, ucb: false },
                Some(&(address, 0xC0)) => Decode::Erase { address, ucb: true },
                Some(_) => Decode::Invalid,
            }
        },
        (ADDR_553C, level) if level <= 2 => {
            if !at(3, ADDR_AAA8) || !at(4, ADDR_AAA8) || !is(5, ADDR_5558, 0x05) {
                return Decode::Invalid;
            }
            if seq.len() < 6 {
                return Decode::Incomplete;
            }
            Decode::TemporaryUnprotect { level, pw1: seq[3].1, pw2: seq[4].1 }
        },
        (ADDR_5554, 0xA0) => match seq.get(3) {
            None => Decode::Incomplete,
            Some(&(address, 0xAA)) => Decode::WritePage { address },
            Some(_) => Decode::Invalid,
        },
        _ => Decode::Invalid,
    }
}

/// Memory and peripherals of the simulated device.
#[derive(Clone, Debug)]
pub struct SimBus {
    controller: FlashController,
    chip_id: u32,
    flash_id: Option<u8>,
    ram: Vec<u8>,
    flash: Vec<u8>,
    procon: [u32; 3],
    status: u32,
    busy_polls: u32,
    stuck_busy: bool,
    erase_polls: u32,
    page_polls: u32,
    passwords: (u32, u32),
    inject_sequence_error: bool,
    seq: Vec<(u32, u32)>,
    page: Vec<u32>,

    /// Flash addresses of committed pages, in order.
    pub page_writes: Vec<u32>,
    /// Addresses of erased sectors, in order.
    pub sector_erases: Vec<u32>,
    /// Addresses of erased user configuration blocks, in order.
    pub ucb_erases: Vec<u32>,
}

impl SimBus {
    fn new(controller: FlashController) -> Self {
        let chip_id = match controller {
            FlashController::Sectors8 => 0x0004_2002,
            FlashController::Sectors9 => 0x0004_4002,
            FlashController::Sectors12 => 0x0004_5004,
            FlashController::Sectors16 => 0x0004_8001,
        };
        SimBus {
            controller,
            chip_id,
            flash_id: None,
            ram: vec![0; RAM_SIZE as usize],
            flash: vec![0; controller.total_size() as usize],
            procon: [0; 3],
            status: 0,
            busy_polls: 0,
            stuck_busy: false,
            erase_polls: 3,
            page_polls: 2,
            passwords: (0, 0),
            inject_sequence_error: false,
            seq: Vec::new(),
            page: Vec::new(),
            page_writes: Vec::new(),
            sector_erases: Vec::new(),
            ucb_erases: Vec::new(),
        }
    }

    fn in_ram(&self, address: u32, len: usize) -> bool {
        address >= RAM_BASE && (address - RAM_BASE) as usize + len <= self.ram.len()
    }

    fn in_flash(&self, address: u32, len: usize) -> bool {
        address >= FLASH_BASE && (address - FLASH_BASE) as usize + len <= self.flash.len()
    }

    fn fsr(&mut self) -> u32 {
        if self.stuck_busy {
            return self.status | FSR_PBUSY;
        }
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            return self.status | FSR_PBUSY;
        }
        self.status
    }

    fn read(&mut self, address: u32) -> Option<u32> {
        if address & 3 != 0 {
            return None;
        }
        let bytes = if self.in_ram(address, 4) {
            let i = (address - RAM_BASE) as usize;
            &self.ram[i..i + 4]
        } else if self.in_flash(address, 4) {
            let i = (address - FLASH_BASE) as usize;
            &self.flash[i..i + 4]
        } else {
            return match address {
                FSR => Some(self.fsr()),
                FLASH_ID => Some((self.flash_id.unwrap_or(self.controller as u8) as u32) << 16),
                SCU_IDCHIP => Some(self.chip_id),
                _ if PROCON.contains(&address) => {
                    let level = PROCON.iter().position(|&a| a == address)?;
                    Some(self.procon[level])
                },
                _ => None,
            };
        };
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn write(&mut self, address: u32, value: u32) -> bool {
        if address & 3 != 0 {
            return false;
        }
        if self.in_ram(address, 4) {
            let i = (address - RAM_BASE) as usize;
            self.ram[i..i + 4].copy_from_slice(&value.to_le_bytes());
            true
        } else if self.in_flash(address, 4) {
            self.command(address, value);
            true
        } else {
            false
        }
    }

    fn command(&mut self, address: u32, value: u32) {
        if self.seq.is_empty() {
            match (address, value) {
                (ADDR_5554, 0xF5) => {
                    self.status &= !FSR_CLEARABLE;
                    return;
                },
                (ADDR_5554, 0x50) => {
                    self.status |= FSR_PFPAGE;
                    self.page.clear();
                    return;
                },
                (ADDR_55F0, _) | (ADDR_55F4, _) => {
                    if self.status & FSR_PFPAGE == 0 || self.page.len() >= PAGE_WORDS as usize {
                        self.status |= FSR_SQER;
                    } else {
                        self.page.push(value);
                    }
                    return;
                },
                _ => (),
            }
        }
        self.seq.push((address, value));
        match decode(&self.seq) {
            Decode::Incomplete => return,
            Decode::Invalid => self.status |= FSR_SQER,
            _ if self.inject_sequence_error => {
                self.inject_sequence_error = false;
                self.status |= FSR_SQER;
            },
            Decode::Erase { address, ucb: false } => self.erase_sector(address),
            Decode::Erase { address, ucb: true } => {
                self.ucb_erases.push(address);
                self.status |= FSR_ERASE;
                self.busy_polls = self.erase_polls;
            },
            Decode::TemporaryUnprotect { level, pw1, pw2 } => {
                if (pw1, pw2) != self.passwords {
                    self.status |= FSR_PROER;
                } else if level == 0 {
                    self.status |= FSR_WPRODIS0;
                } else if level == 1 {
                    self.status |= FSR_WPRODIS1;
                }
            },
            Decode::WritePage { address } => self.write_page(address),
        }
        self.seq.clear();
    }

    fn sector_index(&self, offset: u32) -> Option<usize> {
        self.controller.sectors().iter().position(|s| s.offset == offset)
    }

    fn protection_bit(&self, sector: usize) -> usize {
        if self.controller == FlashController::Sectors12 && sector == 11 { 10 } else { sector }
    }

    fn is_write_protected(&self, sector: usize) -> bool {
        let bit = 1 << self.protection_bit(sector);
        (self.procon[0] & bit != 0 && self.status & FSR_WPRODIS0 == 0)
            || (self.procon[1] & bit != 0 && self.status & FSR_WPRODIS1 == 0)
            || self.procon[2] & bit != 0
    }

    fn erase_sector(&mut self, address: u32) {
        let offset = address.wrapping_sub(FLASH_BASE);
        let sector = match self.sector_index(offset) {
            Some(sector) if self.in_flash(address, 4) => sector,
            _ => {
                self.status |= FSR_SQER;
                return;
            },
        };
        if self.is_write_protected(sector) {
            self.status |= FSR_PROER;
            return;
        }
        let size = self.controller.sectors()[sector].size as usize;
        let start = offset as usize;
        for b in &mut self.flash[start..start + size] {
            *b = 0;
        }
        self.sector_erases.push(address);
        self.status |= FSR_ERASE;
        self.busy_polls = self.erase_polls;
    }

    fn write_page(&mut self, address: u32) {
        if self.status & FSR_PFPAGE == 0 || address % PAGE_SIZE != 0
            || !self.in_flash(address, PAGE_SIZE as usize)
        {
            self.status |= FSR_SQER;
            return;
        }
        self.status &= !FSR_PFPAGE;
        let start = (address - FLASH_BASE) as usize;
        let sector = self.controller.sectors().iter()
            .position(|s| (s.offset..s.offset + s.size).contains(&(start as u32)));
        if sector.map_or(false, |sector| self.is_write_protected(sector)) {
            self.page.clear();
            self.status |= FSR_PROER;
            return;
        }
        let bytes: Vec<u8> = self.page.drain(..).flat_map(|w| w.to_le_bytes()).collect();
        for (dst, src) in self.flash[start..].iter_mut().zip(bytes) {
            // Programming can only set bits of erased (zero) flash.
            *dst |= src;
        }
        self.page_writes.push(address);
        self.status |= FSR_PROG;
        self.busy_polls = self.page_polls;
    }
}

impl TargetBus for SimBus {
    fn load(&mut self, address: u32) -> u32 {
        self.read(address).unwrap_or(0)
    }

    fn store(&mut self, address: u32, value: u32) {
        if !self.write(address, value) {
            log::warn!("Simulated routine wrote to unmapped address 0x{:08X}", address);
        }
    }
}

/// Simulated target implementing [`Target`].
pub struct SimTarget {
    pub bus: SimBus,
    area: WorkingArea,
    halted: bool,
    routine: Option<WriterRoutine>,
    steps_per_access: usize,
    abort_after: Option<u32>,
    fail_wait: bool,
    units_written: u32,

    /// Number of `sleep` calls made by the host.
    pub sleeps: u32,
    /// Every `write_u32` made by the host, in order.
    pub host_writes: Vec<(u32, u32)>,
    /// Number of `write_memory` calls made by the host.
    pub memory_writes: usize,
    /// Registers passed to the last routine started.
    pub last_params: Option<AlgorithmParams>,
}

impl SimTarget {
    /// A halted device with the given flash controller and a 16kB working area.
    pub fn new(controller: FlashController) -> Self {
        SimTarget {
            bus: SimBus::new(controller),
            area: WorkingArea::new(RAM_BASE, 0x4000),
            halted: true,
            routine: None,
            steps_per_access: DEFAULT_STEPS,
            abort_after: None,
            fail_wait: false,
            units_written: 0,
            sleeps: 0,
            host_writes: Vec::new(),
            memory_writes: 0,
            last_params: None,
        }
    }

    pub fn set_working_area(&mut self, size: u32) {
        self.area = WorkingArea::new(RAM_BASE, size.min(RAM_SIZE));
    }

    pub fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    pub fn set_chip_id(&mut self, chip_id: u32) {
        self.bus.chip_id = chip_id;
    }

    /// Override the flash controller ID reported in FLASH_ID.
    pub fn set_flash_id(&mut self, id: u8) {
        self.bus.flash_id = Some(id);
    }

    pub fn set_procon(&mut self, procon: [u32; 3]) {
        self.bus.procon = procon;
    }

    /// Set bits in the flash status register, such as installed protection.
    pub fn set_status_bits(&mut self, bits: u32) {
        self.bus.status |= bits;
    }

    pub fn status_bits(&self) -> u32 {
        self.bus.status
    }

    pub fn set_passwords(&mut self, pw1: u32, pw2: u32) {
        self.bus.passwords = (pw1, pw2);
    }

    /// Keep the flash controller busy forever.
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.bus.stuck_busy = stuck;
    }

    /// Report a sequence error for the next complete command sequence.
    pub fn inject_sequence_error(&mut self) {
        self.bus.inject_sequence_error = true;
    }

    /// Number of routine steps run per host access; lower values make the
    /// host wait on the routine more often.
    pub fn set_steps_per_access(&mut self, steps: usize) {
        self.steps_per_access = steps;
    }

    /// Make the routine report an abort after writing `units` flash words.
    pub fn abort_after(&mut self, units: Option<u32>) {
        self.abort_after = units;
    }

    /// Make the next `wait_algorithm` fail as if the probe connection dropped.
    pub fn fail_next_wait(&mut self) {
        self.fail_wait = true;
    }

    /// Flash words written by routines so far.
    pub fn units_written(&self) -> u32 {
        self.units_written
    }

    pub fn flash(&self) -> &[u8] {
        &self.bus.flash
    }

    pub fn flash_mut(&mut self) -> &mut [u8] {
        &mut self.bus.flash
    }

    pub fn ram(&self) -> &[u8] {
        &self.bus.ram
    }

    fn run(&mut self, steps: usize) {
        let routine = match self.routine.as_mut() {
            Some(routine) if !self.halted => routine,
            _ => return,
        };
        for _ in 0..steps {
            match routine.step(&mut self.bus) {
                Step::Wrote => {
                    self.units_written += 1;
                    if self.abort_after == Some(self.units_written) {
                        log::debug!("Simulated routine aborting after {} units", self.units_written);
                        routine.abort(&mut self.bus);
                    }
                },
                Step::Waiting => (),
                Step::Halted => break,
            }
            if routine.is_halted() {
                break;
            }
        }
        if routine.is_halted() {
            self.halted = true;
        }
    }

    fn tick(&mut self) {
        let steps = self.steps_per_access;
        self.run(steps);
    }
}

impl Target for SimTarget {
    fn read_u32(&mut self, address: u32) -> anyhow::Result<u32> {
        self.tick();
        self.bus.read(address).ok_or_else(|| anyhow!("Bus fault reading 0x{:08X}", address))
    }

    fn write_u32(&mut self, address: u32, value: u32) -> anyhow::Result<()> {
        self.tick();
        self.host_writes.push((address, value));
        if self.bus.write(address, value) {
            Ok(())
        } else {
            bail!("Bus fault writing 0x{:08X}", address)
        }
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> anyhow::Result<()> {
        self.tick();
        let (mem, base) = if self.bus.in_ram(address, data.len()) {
            (&self.bus.ram, RAM_BASE)
        } else if self.bus.in_flash(address, data.len()) {
            (&self.bus.flash, FLASH_BASE)
        } else {
            bail!("Bus fault reading {} bytes at 0x{:08X}", data.len(), address);
        };
        let start = (address - base) as usize;
        data.copy_from_slice(&mem[start..start + data.len()]);
        Ok(())
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> anyhow::Result<()> {
        self.tick();
        self.memory_writes += 1;
        if !self.bus.in_ram(address, data.len()) {
            bail!("Bus fault writing {} bytes at 0x{:08X}", data.len(), address);
        }
        let start = (address - RAM_BASE) as usize;
        self.bus.ram[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn is_halted(&mut self) -> anyhow::Result<bool> {
        self.tick();
        Ok(self.halted)
    }

    fn working_area(&mut self) -> &mut WorkingArea {
        &mut self.area
    }

    fn start_algorithm(&mut self, entry: u32, params: &AlgorithmParams) -> anyhow::Result<()> {
        if !self.halted {
            bail!("Cannot start a routine on a running core");
        }
        let mut code = vec![0u8; WRITER_CODE.len()];
        self.read_memory(entry, &mut code)?;
        if code[..] != WRITER_CODE[..] {
            bail!("Simulated core can only run the flash writer routine");
        }
        self.last_params = Some(*params);
        self.routine = Some(WriterRoutine::start(&mut self.bus, params));
        self.halted = false;
        Ok(())
    }

    fn wait_algorithm(&mut self, _timeout: Duration) -> anyhow::Result<bool> {
        if self.fail_wait {
            self.fail_wait = false;
            bail!("Lost connection to target");
        }
        self.run(WAIT_STEPS);
        Ok(self.halted)
    }

    fn halt(&mut self) -> anyhow::Result<()> {
        if let Some(routine) = self.routine.as_mut() {
            routine.halt();
        }
        self.halted = true;
        Ok(())
    }

    fn sleep(&mut self, _duration: Duration) {
        self.sleeps += 1;
        self.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        let erase = [(ADDR_5554, 0xAA), (ADDR_AAA8, 0x55), (ADDR_5554, 0x80),
                     (ADDR_5554, 0xAA), (ADDR_AAA8, 0x55), (0x0C00_4000, 0x30)];
        for n in 1..6 {
            assert_eq!(decode(&erase[..n]), Decode::Incomplete);
        }
        assert_eq!(decode(&erase), Decode::Erase { address: 0x0C00_4000, ucb: false });
        assert_eq!(decode(&[(ADDR_AAA8, 0x55)]), Decode::Invalid);
        assert_eq!(decode(&[(ADDR_5554, 0xAA), (ADDR_AAA8, 0x55), (ADDR_5554, 0x99)]),
                   Decode::Invalid);
    }

    #[test]
    fn test_clear_status() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.write_u32(0x0C00_5554, 0x12).unwrap();
        assert_ne!(sim.status_bits() & FSR_SQER, 0);
        sim.write_u32(0x0C00_5554, 0xF5).unwrap();
        assert_eq!(sim.status_bits() & FSR_SQER, 0);
    }

    #[test]
    fn test_page_write() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.write_u32(ADDR_5554, 0x50).unwrap();
        for i in 0..(PAGE_WORDS / 2) {
            sim.write_u32(ADDR_55F0, i).unwrap();
            sim.write_u32(ADDR_55F4, 0xFF00_0000).unwrap();
        }
        for &(a, v) in &[(ADDR_5554, 0xAA), (ADDR_AAA8, 0x55), (ADDR_5554, 0xA0), (0x0C00_0100, 0xAA)] {
            sim.write_u32(a, v).unwrap();
        }
        assert_eq!(sim.bus.page_writes, vec![0x0C00_0100]);
        assert_eq!(&sim.flash()[0x100..0x108], &[0, 0, 0, 0, 0, 0, 0, 0xFF]);
        assert_eq!(&sim.flash()[0x1F8..0x200], &[31, 0, 0, 0, 0, 0, 0, 0xFF]);
        assert_eq!(sim.status_bits() & FSR_PFPAGE, 0);
    }

    #[test]
    fn test_page_write_protected() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        sim.set_procon([0, 1 << 1, 0]);
        sim.write_u32(ADDR_5554, 0x50).unwrap();
        sim.write_u32(ADDR_55F0, 0xFFFF_FFFF).unwrap();
        for &(a, v) in &[(ADDR_5554, 0xAA), (ADDR_AAA8, 0x55), (ADDR_5554, 0xA0), (0x0C00_4000, 0xAA)] {
            sim.write_u32(a, v).unwrap();
        }
        assert!(sim.bus.page_writes.is_empty());
        assert_eq!(sim.flash()[0x4000], 0);
        assert_ne!(sim.status_bits() & FSR_PROER, 0);
    }

    #[test]
    fn test_unmapped() {
        let mut sim = SimTarget::new(FlashController::Sectors8);
        assert!(sim.read_u32(0x4000_0000).is_err());
        assert!(sim.write_u32(0x2000_0002, 0).is_err());
        assert_eq!(sim.read_u32(FLASH_ID).unwrap(), 0x9C << 16);
    }
}
