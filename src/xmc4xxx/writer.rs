//! Streaming writes through the on-target writer routine.
//!
//! The host and the routine share a circular buffer in the work area. The host
//! owns the write pointer cell and the routine owns the read pointer cell; each
//! side only ever writes its own cell. One slot is always left empty, so equal
//! pointers mean the buffer is empty.

use std::time::Duration;
use crate::target::{Target, AlgorithmParams, Region};
use super::{Error, Result, status::{self, POLL_INTERVAL}};
use super::loader::{
    TargetBus, WRITER_CODE, WP_OFFSET, RP_OFFSET, HEADER_SIZE, STACK_SIZE, FLASH_WORD_SIZE,
};

/// Location of the shared pointer cells and the buffer data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Fifo {
    wp_cell: u32,
    rp_cell: u32,
    start: u32,
    end: u32,
}

impl Fifo {
    /// Lay out a FIFO in a work area spanning `work_area` to `end`.
    pub fn from_bounds(work_area: u32, end: u32) -> Self {
        Fifo {
            wp_cell: work_area + WP_OFFSET,
            rp_cell: work_area + RP_OFFSET,
            start: work_area + HEADER_SIZE,
            end,
        }
    }

    pub fn new(work_area: Region) -> Self {
        Self::from_bounds(work_area.address, work_area.end())
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Point both cells at the start of the buffer.
    pub fn reset<T: Target>(&self, target: &mut T) -> Result<Producer> {
        target.write_u32(self.wp_cell, self.start)?;
        target.write_u32(self.rp_cell, self.start)?;
        Ok(Producer { fifo: *self, wp: self.start })
    }

    /// Attach the routine's side, picking up the read pointer the host set.
    pub fn consumer<B: TargetBus>(&self, bus: &mut B) -> Consumer {
        let rp = bus.load(self.rp_cell);
        Consumer { fifo: *self, start: rp, rp }
    }

    fn check_rp(&self, rp: u32) -> Result<u32> {
        if rp == 0 {
            return Err(Error::TargetAborted);
        }
        if rp % FLASH_WORD_SIZE != self.start % FLASH_WORD_SIZE || rp < self.start || rp >= self.end {
            return Err(Error::CorruptReadPointer(rp));
        }
        Ok(rp)
    }
}

/// Host side of the FIFO; only writes the write pointer cell.
#[derive(Debug)]
pub struct Producer {
    fifo: Fifo,
    wp: u32,
}

impl Producer {
    /// Read and validate the routine's read pointer.
    pub fn read_rp<T: Target>(&self, target: &mut T) -> Result<u32> {
        let rp = target.read_u32(self.fifo.rp_cell)?;
        self.fifo.check_rp(rp)
    }

    /// Contiguous space that can be filled from the write pointer onwards.
    pub fn free_space(&self, rp: u32) -> u32 {
        if rp > self.wp {
            rp - self.wp - FLASH_WORD_SIZE
        } else if rp > self.fifo.start {
            self.fifo.end - self.wp
        } else {
            self.fifo.end - self.wp - FLASH_WORD_SIZE
        }
    }

    /// Copy as much of `data` as fits, then publish the new write pointer.
    ///
    /// Returns the number of bytes taken, always a whole number of flash words.
    pub fn push<T: Target>(&mut self, target: &mut T, data: &[u8]) -> Result<usize> {
        let rp = self.read_rp(target)?;
        let free = self.free_space(rp) as usize;
        let n = free.min(data.len()) / FLASH_WORD_SIZE as usize * FLASH_WORD_SIZE as usize;
        if n == 0 {
            return Ok(0);
        }
        log::trace!("FIFO rp=0x{:08X} wp=0x{:08X}, pushing {} bytes", rp, self.wp, n);
        target.write_memory(self.wp, &data[..n])?;
        self.wp += n as u32;
        if self.wp >= self.fifo.end {
            self.wp = self.fifo.start;
        }
        target.write_u32(self.fifo.wp_cell, self.wp)?;
        Ok(n)
    }

    /// Tell the routine to stop by clearing the write pointer.
    pub fn cancel<T: Target>(&mut self, target: &mut T) -> Result<()> {
        log::debug!("Cancelling flash writer");
        target.write_u32(self.fifo.wp_cell, 0)?;
        Ok(())
    }
}

/// Routine side of the FIFO; only writes the read pointer cell.
#[derive(Debug)]
pub struct Consumer {
    fifo: Fifo,
    start: u32,
    rp: u32,
}

impl Consumer {
    pub fn position(&self) -> u32 {
        self.rp
    }

    /// Bytes readable without wrapping, or None if the host cancelled.
    pub fn available<B: TargetBus>(&self, bus: &mut B) -> Option<u32> {
        let wp = bus.load(self.fifo.wp_cell);
        if wp == 0 {
            None
        } else if wp >= self.rp {
            Some(wp - self.rp)
        } else {
            Some(self.fifo.end - self.rp)
        }
    }

    pub fn advance<B: TargetBus>(&mut self, bus: &mut B, n: u32) {
        self.rp += n;
        if self.rp >= self.fifo.end {
            self.rp = self.start;
        }
        bus.store(self.fifo.rp_cell, self.rp);
    }

    /// Clear the read pointer cell, which the host treats as an abort.
    pub fn abort<B: TargetBus>(&mut self, bus: &mut B) {
        bus.store(self.fifo.rp_cell, 0);
    }
}

/// Limits for a block write.
#[derive(Copy, Clone, Debug)]
pub struct BlockWriteConfig {
    pub min_buffer: u32,
    pub max_buffer: u32,
    pub algorithm_timeout: Duration,
}

impl Default for BlockWriteConfig {
    fn default() -> Self {
        BlockWriteConfig {
            min_buffer: 256,
            max_buffer: 16 * 1024,
            algorithm_timeout: Duration::from_secs(5),
        }
    }
}

/// Write `data` to flash at `address` using the writer routine.
///
/// `data` must be a whole number of flash words. `cb` is called with the number
/// of bytes handed to the routine so far.
///
/// Working area is released and flash status cleared whether or not the
/// write succeeds. Only the last page's errors are still in the status
/// register when the routine finishes, since it clears status before each
/// page.
pub fn write_block<T: Target, F: FnMut(usize)>(
    target: &mut T, address: u32, data: &[u8], config: &BlockWriteConfig, cb: F,
) -> Result<()> {
    let code = alloc(target, WRITER_CODE.len() as u32)?;
    let mut result = write_with_code(target, code, address, data, config, cb);
    target.working_area().free(code);
    if result.is_ok() {
        result = check_page_status(target);
    }
    if let Err(e) = status::clear_status(target) {
        log::warn!("Could not clear flash status after write: {}", e);
    }
    result
}

/// Report errors the routine's page commands left in the status register.
fn check_page_status<T: Target>(target: &mut T) -> Result<()> {
    let status = status::read_status(target)?;
    if status.get_sqer() {
        log::error!("Flash page write sequence error ({})", status);
        Err(Error::SequenceError)
    } else if status.get_proer() {
        log::error!("Flash page write blocked by protection ({})", status);
        Err(Error::ProtectionViolation)
    } else {
        Ok(())
    }
}

fn alloc<T: Target>(target: &mut T, size: u32) -> Result<Region> {
    let available = target.working_area().available();
    target.working_area().alloc(size).ok_or(Error::ResourceExhausted { needed: size, available })
}

fn write_with_code<T: Target, F: FnMut(usize)>(
    target: &mut T, code: Region, address: u32, data: &[u8], config: &BlockWriteConfig, cb: F,
) -> Result<()> {
    target.write_memory(code.address, &WRITER_CODE)?;

    let available = target.working_area().available();
    let buffer_size = available.saturating_sub(HEADER_SIZE) & !(FLASH_WORD_SIZE - 1);
    if buffer_size < config.min_buffer {
        log::warn!("Only {} bytes of buffer available, need at least {}",
                   buffer_size, config.min_buffer);
        return Err(Error::ResourceExhausted {
            needed: config.min_buffer + HEADER_SIZE, available,
        });
    }
    let buffer_size = buffer_size.min(config.max_buffer);
    log::debug!("Using {} byte write buffer", buffer_size);

    let source = alloc(target, buffer_size + HEADER_SIZE)?;
    let result = run_writer(target, code, source, address, data, config, cb);
    target.working_area().free(source);
    result
}

fn run_writer<T: Target, F: FnMut(usize)>(
    target: &mut T, code: Region, source: Region, address: u32, data: &[u8],
    config: &BlockWriteConfig, cb: F,
) -> Result<()> {
    let fifo = Fifo::new(source);
    let mut producer = fifo.reset(target)?;
    let params = AlgorithmParams {
        args: [source.address, source.end(), address, data.len() as u32 / FLASH_WORD_SIZE],
        stack_pointer: source.address + STACK_SIZE,
    };
    target.start_algorithm(code.address, &params)?;

    let mut result = feed(target, &mut producer, data, timeout_polls(config), cb);
    if result.is_err() {
        if let Err(e) = producer.cancel(target) {
            log::warn!("Could not cancel flash writer: {}", e);
        }
    }

    match target.wait_algorithm(config.algorithm_timeout) {
        Ok(true) => (),
        Ok(false) => {
            log::error!("Flash writer did not finish, halting core");
            target.halt()?;
            if result.is_ok() {
                result = Err(Error::Timeout);
            }
        },
        Err(e) => {
            log::error!("Lost track of flash writer, halting core");
            if let Err(e) = target.halt() {
                log::warn!("Could not halt core: {}", e);
            }
            if result.is_ok() {
                result = Err(e.into());
            }
        },
    }

    // A failure after the last data was queued only shows up once it halts.
    if result.is_ok() {
        producer.read_rp(target)?;
    }
    result
}

/// Polls allowed without the routine making room in the buffer.
fn timeout_polls(config: &BlockWriteConfig) -> u32 {
    (config.algorithm_timeout.as_millis() / POLL_INTERVAL.as_millis()).max(1) as u32
}

fn feed<T: Target, F: FnMut(usize)>(
    target: &mut T, producer: &mut Producer, data: &[u8], timeout: u32, mut cb: F,
) -> Result<()> {
    let mut sent = 0;
    let mut remaining = timeout;
    while sent < data.len() {
        let n = producer.push(target, &data[sent..])?;
        if n == 0 {
            if target.is_halted()? {
                log::error!("Flash writer stopped with {} bytes unwritten", data.len() - sent);
                return Err(Error::TargetAborted);
            }
            if remaining == 0 {
                log::error!("Flash writer stalled with {} bytes unwritten", data.len() - sent);
                return Err(Error::Timeout);
            }
            remaining -= 1;
            target.sleep(POLL_INTERVAL);
            continue;
        }
        remaining = timeout;
        sent += n;
        cb(sent);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fifo() -> Fifo {
        Fifo::from_bounds(0x2000_0000, 0x2000_0000 + HEADER_SIZE + 64)
    }

    #[test]
    fn test_free_space() {
        let fifo = fifo();
        let start = fifo.start();
        let mut producer = Producer { fifo, wp: start };

        // Empty, with the reader at the start: one slot stays free.
        assert_eq!(producer.free_space(start), 56);

        // Reader has moved on, fill to the end.
        producer.wp = start + 32;
        assert_eq!(producer.free_space(start + 16), 32);

        // Writer has wrapped behind the reader.
        producer.wp = start + 8;
        assert_eq!(producer.free_space(start + 40), 24);

        // Full.
        assert_eq!(producer.free_space(start + 16), 0);
    }

    #[test]
    fn test_timeout_polls() {
        let mut config = BlockWriteConfig::default();
        assert_eq!(timeout_polls(&config), 5000);
        config.algorithm_timeout = Duration::from_millis(10);
        assert_eq!(timeout_polls(&config), 10);
        config.algorithm_timeout = Duration::from_micros(10);
        assert_eq!(timeout_polls(&config), 1);
    }

    #[test]
    fn test_check_rp() {
        let fifo = fifo();
        assert!(matches!(fifo.check_rp(0), Err(Error::TargetAborted)));
        assert!(matches!(fifo.check_rp(fifo.start() + 4), Err(Error::CorruptReadPointer(_))));
        assert!(matches!(fifo.check_rp(fifo.end()), Err(Error::CorruptReadPointer(_))));
        assert!(matches!(fifo.check_rp(0x2000_0000), Err(Error::CorruptReadPointer(_))));
        assert_eq!(fifo.check_rp(fifo.start() + 8).unwrap(), fifo.start() + 8);
    }
}
