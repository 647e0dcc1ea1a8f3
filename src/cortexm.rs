//! Cortex-M core control through the debug registers.

use std::time::{Duration, Instant};
use thiserror::Error;
use num_enum::IntoPrimitive;
use crate::swd::{self, SWD};
use crate::target::{Target, AlgorithmParams, WorkingArea};

#[derive(Error, Debug)]
pub enum Error {
    #[error("SWD error")]
    SWD(#[from] swd::Error),
    #[error("Core did not halt.")]
    HaltTimeout,
    #[error("Core register transfer did not complete.")]
    RegisterTimeout,
    #[error("Core is running, halt it first.")]
    NotHalted,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;
const DEMCR: u32 = 0xE000_EDFC;

const DBGKEY: u32 = 0xA05F << 16;
const C_DEBUGEN: u32 = 1 << 0;
const C_HALT: u32 = 1 << 1;
const C_MASKINTS: u32 = 1 << 3;
const S_REGRDY: u32 = 1 << 16;
const S_HALT: u32 = 1 << 17;

const DCRSR_REGWNR: u32 = 1 << 16;

/// Halt on core reset, so a reset during programming stops the core.
const DEMCR_VC_CORERESET: u32 = 1 << 0;

/// Thumb state bit of xPSR.
const XPSR_THUMB: u32 = 1 << 24;

const POLL_ATTEMPTS: usize = 100;

/// Core register numbers as used by DCRSR.
#[derive(Copy, Clone, Debug, IntoPrimitive)]
#[repr(u32)]
pub enum CoreRegister {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    SP = 13,
    LR = 14,
    PC = 15,
    XPSR = 16,
}

impl CoreRegister {
    fn arg(index: usize) -> CoreRegister {
        [CoreRegister::R0, CoreRegister::R1, CoreRegister::R2, CoreRegister::R3][index]
    }
}

/// A halted Cortex-M core with a region of RAM reserved for routines.
pub struct CortexM {
    swd: SWD,
    area: WorkingArea,
}

impl CortexM {
    /// Take control of the core behind `swd`, halting it.
    pub fn attach(swd: SWD, area: WorkingArea) -> Result<Self> {
        let mut core = CortexM { swd, area };
        core.halt_core()?;
        let demcr = core.swd.read_u32(DEMCR)?;
        core.swd.write_u32(DEMCR, demcr | DEMCR_VC_CORERESET)?;
        Ok(core)
    }

    pub fn halt_core(&mut self) -> Result<()> {
        log::debug!("Halting core");
        self.swd.write_u32(DHCSR, DBGKEY | C_DEBUGEN | C_HALT)?;
        for _ in 0..POLL_ATTEMPTS {
            if self.core_halted()? {
                return Ok(());
            }
        }
        Err(Error::HaltTimeout)
    }

    /// Resume the core with interrupts masked.
    pub fn run(&mut self) -> Result<()> {
        log::debug!("Resuming core");
        // MASKINTS may only be changed while halted.
        self.swd.write_u32(DHCSR, DBGKEY | C_DEBUGEN | C_HALT | C_MASKINTS)?;
        self.swd.write_u32(DHCSR, DBGKEY | C_DEBUGEN | C_MASKINTS)?;
        Ok(())
    }

    /// Give the core back to its firmware, clearing debug halting.
    pub fn detach(&mut self) -> Result<()> {
        log::debug!("Releasing core");
        let demcr = self.swd.read_u32(DEMCR)?;
        self.swd.write_u32(DEMCR, demcr & !DEMCR_VC_CORERESET)?;
        self.swd.write_u32(DHCSR, DBGKEY)?;
        Ok(())
    }

    pub fn core_halted(&mut self) -> Result<bool> {
        Ok(self.swd.read_u32(DHCSR)? & S_HALT != 0)
    }

    pub fn write_core_reg(&mut self, register: CoreRegister, value: u32) -> Result<()> {
        if !self.core_halted()? {
            return Err(Error::NotHalted);
        }
        let number: u32 = register.into();
        log::trace!("Core register {} <- 0x{:08X}", number, value);
        self.swd.write_u32(DCRDR, value)?;
        self.swd.write_u32(DCRSR, DCRSR_REGWNR | number)?;
        for _ in 0..POLL_ATTEMPTS {
            if self.swd.read_u32(DHCSR)? & S_REGRDY != 0 {
                return Ok(());
            }
        }
        Err(Error::RegisterTimeout)
    }

    pub fn swd(&mut self) -> &mut SWD {
        &mut self.swd
    }
}

impl Target for CortexM {
    fn read_u32(&mut self, address: u32) -> anyhow::Result<u32> {
        Ok(self.swd.read_u32(address)?)
    }

    fn write_u32(&mut self, address: u32, value: u32) -> anyhow::Result<()> {
        Ok(self.swd.write_u32(address, value)?)
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> anyhow::Result<()> {
        Ok(self.swd.read_memory(address, data)?)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> anyhow::Result<()> {
        Ok(self.swd.write_memory(address, data)?)
    }

    fn is_halted(&mut self) -> anyhow::Result<bool> {
        Ok(self.core_halted()?)
    }

    fn working_area(&mut self) -> &mut WorkingArea {
        &mut self.area
    }

    fn start_algorithm(&mut self, entry: u32, params: &AlgorithmParams) -> anyhow::Result<()> {
        log::debug!("Starting routine at 0x{:08X}", entry);
        for (index, &value) in params.args.iter().enumerate() {
            self.write_core_reg(CoreRegister::arg(index), value)?;
        }
        self.write_core_reg(CoreRegister::SP, params.stack_pointer)?;
        self.write_core_reg(CoreRegister::LR, entry | 1)?;
        self.write_core_reg(CoreRegister::PC, entry & !1)?;
        self.write_core_reg(CoreRegister::XPSR, XPSR_THUMB)?;
        self.run()?;
        Ok(())
    }

    fn wait_algorithm(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        let t0 = Instant::now();
        loop {
            if self.core_halted()? {
                return Ok(true);
            }
            if t0.elapsed() > timeout {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn halt(&mut self) -> anyhow::Result<()> {
        Ok(self.halt_core()?)
    }
}
