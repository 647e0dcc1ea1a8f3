//! Capabilities the flash engine needs from a debug connection.
//!
//! The engine never talks to a probe directly. Anything that can access target
//! memory, hand out scratch RAM and run a routine on the core implements
//! [`Target`]: the Cortex-M debug link for real hardware, and the simulator for
//! tests.

use std::time::Duration;

/// Access to a halted target.
///
/// Methods return `anyhow::Result` so implementations can surface whatever
/// transport errors they have.
pub trait Target {
    /// Read one 32-bit word.
    fn read_u32(&mut self, address: u32) -> anyhow::Result<u32>;

    /// Write one 32-bit word.
    fn write_u32(&mut self, address: u32, value: u32) -> anyhow::Result<()>;

    /// Fill `data` from target memory starting at `address`.
    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> anyhow::Result<()>;

    /// Copy `data` into target memory starting at `address`.
    fn write_memory(&mut self, address: u32, data: &[u8]) -> anyhow::Result<()>;

    /// True if the core is halted.
    fn is_halted(&mut self) -> anyhow::Result<bool>;

    /// Scratch RAM available for routines and their buffers.
    fn working_area(&mut self) -> &mut WorkingArea;

    /// Load `params` into the core registers and resume execution at `entry`.
    ///
    /// Returns as soon as the core is running.
    fn start_algorithm(&mut self, entry: u32, params: &AlgorithmParams) -> anyhow::Result<()>;

    /// Wait up to `timeout` for a running routine to halt.
    ///
    /// Returns `Ok(false)` if it is still running when the timeout expires.
    fn wait_algorithm(&mut self, timeout: Duration) -> anyhow::Result<bool>;

    /// Halt the core.
    fn halt(&mut self) -> anyhow::Result<()>;

    /// Pause between status polls.
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Register values handed to a routine when it starts.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AlgorithmParams {
    /// Values for r0 to r3.
    pub args: [u32; 4],
    pub stack_pointer: u32,
}

/// A block of target RAM handed out by a [`WorkingArea`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub address: u32,
    pub size: u32,
}

impl Region {
    /// First address past the end of the region.
    pub fn end(&self) -> u32 {
        self.address + self.size
    }
}

/// Bump allocator over a fixed range of target RAM.
///
/// Allocations are 8-byte aligned and stacked upwards; freeing the topmost
/// allocation releases its space.
#[derive(Clone, Debug)]
pub struct WorkingArea {
    base: u32,
    size: u32,
    live: Vec<Region>,
}

impl WorkingArea {
    const ALIGN: u32 = 8;

    pub fn new(base: u32, size: u32) -> Self {
        WorkingArea { base, size, live: Vec::new() }
    }

    /// Start of the next allocation.
    fn top(&self) -> u32 {
        match self.live.iter().map(Region::end).max() {
            Some(end) => (end + Self::ALIGN - 1) & !(Self::ALIGN - 1),
            None => self.base,
        }
    }

    /// Largest allocation that would currently succeed.
    pub fn available(&self) -> u32 {
        (self.base + self.size).saturating_sub(self.top())
    }

    pub fn alloc(&mut self, size: u32) -> Option<Region> {
        if size == 0 || size > self.available() {
            log::debug!("Working area cannot satisfy {} bytes ({} available)",
                        size, self.available());
            return None;
        }
        let region = Region { address: self.top(), size };
        log::trace!("Allocated {} bytes of working area at 0x{:08X}", size, region.address);
        self.live.push(region);
        Some(region)
    }

    pub fn free(&mut self, region: Region) {
        log::trace!("Freeing working area at 0x{:08X}", region.address);
        self.live.retain(|r| *r != region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_area() {
        let mut area = WorkingArea::new(0x2000_0000, 0x1000);
        assert_eq!(area.available(), 0x1000);

        let code = area.alloc(124).unwrap();
        assert_eq!(code.address, 0x2000_0000);
        assert_eq!(area.available(), 0x1000 - 128);

        let data = area.alloc(area.available()).unwrap();
        assert_eq!(data.address, 0x2000_0080);
        assert_eq!(data.end(), 0x2000_1000);
        assert!(area.alloc(4).is_none());

        area.free(data);
        area.free(code);
        assert_eq!(area.available(), 0x1000);
        assert!(area.alloc(0x1001).is_none());
    }
}
