//! ADIv5 debug port and memory access port over SWD.
//!
//! Only what flash programming needs: a single MEM-AP (AP 0) performing
//! 32-bit accesses with auto-incrementing addresses.

use std::time::Duration;
use thiserror::Error;
use crate::dap::{self, DAP, Port, Transfer};

#[derive(Error, Debug)]
pub enum Error {
    #[error("DAP error")]
    DAP(#[from] dap::Error),
    #[error("Invalid DPIDR 0x{0:08X}, check target connection.")]
    BadDPIDR(u32),
    #[error("Debug port did not acknowledge power-up request.")]
    PowerUp,
    #[error("Memory access at 0x{0:08X} is not word aligned.")]
    Unaligned(u32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// DP register addresses.
mod dp {
    pub const DPIDR: u8 = 0x0;
    pub const ABORT: u8 = 0x0;
    pub const CTRL_STAT: u8 = 0x4;
    pub const SELECT: u8 = 0x8;
}

/// MEM-AP register addresses.
mod ap {
    pub const CSW: u8 = 0x00;
    pub const TAR: u8 = 0x04;
    pub const DRW: u8 = 0x0C;
    pub const IDR: u8 = 0xFC;
}

const CDBGPWRUPREQ: u32 = 1 << 28;
const CDBGPWRUPACK: u32 = 1 << 29;
const CSYSPWRUPREQ: u32 = 1 << 30;
const CSYSPWRUPACK: u32 = 1 << 31;

/// Clear STKCMPCLR, STKERRCLR, WDERRCLR and ORUNERRCLR.
const ABORT_CLEAR_ALL: u32 = 0b11110;

/// 32-bit transfers, single auto-increment, privileged debug access.
const CSW_WORD_INC: u32 = 0x2300_0012;

/// TAR auto-increment is only guaranteed within a 1kB block.
const TAR_WRAP: u32 = 0x400;

const POWERUP_ATTEMPTS: usize = 100;

pub struct SWD {
    dap: DAP,
    select: Option<u32>,
}

impl SWD {
    /// Switch the link to SWD, power up the debug domain and set up MEM-AP 0.
    pub fn new(dap: DAP) -> Result<Self> {
        let mut swd = SWD { dap, select: None };
        let idcode = swd.line_reset()?;
        log::info!("Connected to debug port, DPIDR 0x{:08X}", idcode);
        swd.write_dp(dp::ABORT, ABORT_CLEAR_ALL)?;
        swd.power_up()?;
        swd.write_ap(ap::CSW, CSW_WORD_INC)?;
        let idr = swd.read_ap(ap::IDR)?;
        log::debug!("AP0 IDR 0x{:08X}", idr);
        Ok(swd)
    }

    pub fn set_clock(&self, freq: u32) -> Result<()> {
        Ok(self.dap.set_clock(freq)?)
    }

    pub fn pulse_nrst(&self, duration: Duration) -> Result<()> {
        Ok(self.dap.pulse_nrst(duration)?)
    }

    /// Send the JTAG-to-SWD switch sequence, surrounded by line resets,
    /// and read DPIDR to leave the reset state.
    fn line_reset(&mut self) -> Result<u32> {
        log::debug!("Switching to SWD and resetting line");
        let ones = [0xFF; 7];
        self.dap.swj_sequence(51, &ones)?;
        self.dap.swj_sequence(16, &0xE79Eu16.to_le_bytes())?;
        self.dap.swj_sequence(51, &ones)?;
        self.dap.swj_sequence(8, &[0x00])?;
        self.select = None;
        let idcode = self.read_dp(dp::DPIDR)?;
        if idcode == 0 || idcode == 0xFFFF_FFFF {
            return Err(Error::BadDPIDR(idcode));
        }
        Ok(idcode)
    }

    fn power_up(&mut self) -> Result<()> {
        log::debug!("Requesting debug power-up");
        self.write_dp(dp::CTRL_STAT, CSYSPWRUPREQ | CDBGPWRUPREQ)?;
        for _ in 0..POWERUP_ATTEMPTS {
            let stat = self.read_dp(dp::CTRL_STAT)?;
            if stat & (CSYSPWRUPACK | CDBGPWRUPACK) == (CSYSPWRUPACK | CDBGPWRUPACK) {
                return Ok(());
            }
        }
        Err(Error::PowerUp)
    }

    pub fn read_dp(&mut self, register: u8) -> Result<u32> {
        let values = self.dap.transfer(&[Transfer::Read { port: Port::DP, register }])?;
        values.first().copied().ok_or(Error::DAP(dap::Error::InvalidResponse))
    }

    pub fn write_dp(&mut self, register: u8, value: u32) -> Result<()> {
        self.dap.transfer(&[Transfer::Write { port: Port::DP, register, value }])?;
        Ok(())
    }

    /// Point SELECT at the bank holding `register` of AP 0, skipping the
    /// write if it is already selected.
    fn select_bank(&mut self, register: u8) -> Result<()> {
        let select = (register & 0xF0) as u32;
        if self.select != Some(select) {
            log::trace!("SELECT <- 0x{:08X}", select);
            self.write_dp(dp::SELECT, select)?;
            self.select = Some(select);
        }
        Ok(())
    }

    pub fn read_ap(&mut self, register: u8) -> Result<u32> {
        self.select_bank(register)?;
        let register = register & 0x0C;
        let values = self.dap.transfer(&[Transfer::Read { port: Port::AP, register }])?;
        values.first().copied().ok_or(Error::DAP(dap::Error::InvalidResponse))
    }

    pub fn write_ap(&mut self, register: u8, value: u32) -> Result<()> {
        self.select_bank(register)?;
        let register = register & 0x0C;
        self.dap.transfer(&[Transfer::Write { port: Port::AP, register, value }])?;
        Ok(())
    }

    pub fn read_u32(&mut self, address: u32) -> Result<u32> {
        check_aligned(address)?;
        self.select_bank(ap::TAR)?;
        let values = self.dap.transfer(&[
            Transfer::Write { port: Port::AP, register: ap::TAR, value: address },
            Transfer::Read { port: Port::AP, register: ap::DRW },
        ])?;
        values.first().copied().ok_or(Error::DAP(dap::Error::InvalidResponse))
    }

    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<()> {
        check_aligned(address)?;
        self.select_bank(ap::TAR)?;
        self.dap.transfer(&[
            Transfer::Write { port: Port::AP, register: ap::TAR, value: address },
            Transfer::Write { port: Port::AP, register: ap::DRW, value },
        ])?;
        Ok(())
    }

    /// Read consecutive words starting at `address`.
    pub fn read_block(&mut self, address: u32, data: &mut [u32]) -> Result<()> {
        check_aligned(address)?;
        for (address, range) in block_chunks(address, data.len(), self.dap.block_words()) {
            self.write_ap(ap::TAR, address)?;
            let words = self.dap.transfer_block_read(Port::AP, ap::DRW, range.len())?;
            data[range].copy_from_slice(&words);
        }
        Ok(())
    }

    /// Write consecutive words starting at `address`.
    pub fn write_block(&mut self, address: u32, data: &[u32]) -> Result<()> {
        check_aligned(address)?;
        for (address, range) in block_chunks(address, data.len(), self.dap.block_words()) {
            self.write_ap(ap::TAR, address)?;
            self.dap.transfer_block_write(Port::AP, ap::DRW, &data[range])?;
        }
        Ok(())
    }

    /// Read bytes from any address, widening to whole words.
    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let start = address & !3;
        let end = (address + data.len() as u32 + 3) & !3;
        let mut words = vec![0u32; ((end - start) / 4) as usize];
        self.read_block(start, &mut words)?;
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let skip = (address - start) as usize;
        data.copy_from_slice(&bytes[skip..skip + data.len()]);
        Ok(())
    }

    /// Write bytes to any address, preserving neighbouring bytes of partial words.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let start = address & !3;
        let end = (address + data.len() as u32 + 3) & !3;
        let skip = (address - start) as usize;
        let mut bytes = vec![0u8; (end - start) as usize];
        if skip != 0 || bytes.len() != data.len() {
            self.read_memory(start, &mut bytes)?;
        }
        bytes[skip..skip + data.len()].copy_from_slice(data);
        let words: Vec<u32> = bytes.chunks_exact(4)
                                   .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                                   .collect();
        self.write_block(start, &words)
    }
}

fn check_aligned(address: u32) -> Result<()> {
    if address & 3 != 0 {
        Err(Error::Unaligned(address))
    } else {
        Ok(())
    }
}

/// Split a run of `count` words at `address` into block transfers that neither
/// cross a TAR wrap boundary nor exceed `max_words`.
///
/// Yields each chunk's start address and its index range into the word buffer.
fn block_chunks(address: u32, count: usize, max_words: usize)
    -> Vec<(u32, std::ops::Range<usize>)>
{
    let mut chunks = Vec::new();
    let mut done = 0;
    while done < count {
        let addr = address + (done as u32) * 4;
        let to_wrap = ((TAR_WRAP - (addr % TAR_WRAP)) / 4) as usize;
        let n = (count - done).min(to_wrap).min(max_words.max(1));
        chunks.push((addr, done..done + n));
        done += n;
    }
    chunks
}

#[test]
fn test_block_chunks() {
    // Splits at the 1kB boundary.
    let chunks = block_chunks(0x2000_03F0, 8, 256);
    assert_eq!(chunks, vec![(0x2000_03F0, 0..4), (0x2000_0400, 4..8)]);

    // Splits on packet size.
    let chunks = block_chunks(0x2000_0000, 40, 14);
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[2], (0x2000_0070, 28..40));

    assert!(block_chunks(0x2000_0000, 0, 14).is_empty());
}
