use std::time::Duration;
use crate::target::Target;
use super::{Error, Result, command::CommandSequence};

/// Flash status register.
pub const FSR: u32 = 0x5800_2010;

/// Interval between status polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Flash status register contents.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashStatus(pub u32);

impl FlashStatus {
    fn bit(&self, n: u32) -> bool {
        (self.0 >> n) & 1 == 1
    }

    /// Program flash busy.
    pub fn get_pbusy(&self) -> bool { self.bit(0) }
    /// Flash array busy.
    pub fn get_fabusy(&self) -> bool { self.bit(1) }
    pub fn get_prog(&self) -> bool { self.bit(4) }
    pub fn get_erase(&self) -> bool { self.bit(5) }
    /// Page mode entered.
    pub fn get_pfpage(&self) -> bool { self.bit(6) }
    pub fn get_pfoper(&self) -> bool { self.bit(8) }
    /// Command sequence error.
    pub fn get_sqer(&self) -> bool { self.bit(10) }
    /// Protection error.
    pub fn get_proer(&self) -> bool { self.bit(11) }
    pub fn get_pfsber(&self) -> bool { self.bit(12) }
    pub fn get_pfdber(&self) -> bool { self.bit(14) }
    /// Protection installed.
    pub fn get_proin(&self) -> bool { self.bit(16) }
    /// Read protection installed.
    pub fn get_rproin(&self) -> bool { self.bit(18) }
    /// Read protection disabled.
    pub fn get_rprodis(&self) -> bool { self.bit(19) }
    /// Write protection installed for user `level`.
    pub fn get_wproin(&self, level: u32) -> bool { level < 3 && self.bit(21 + level) }
    /// Write protection disabled for user `level`.
    pub fn get_wprodis(&self, level: u32) -> bool { level < 2 && self.bit(25 + level) }
    pub fn get_slm(&self) -> bool { self.bit(28) }
    pub fn get_ver(&self) -> bool { self.bit(31) }

    pub fn is_busy(&self) -> bool {
        self.get_pbusy()
    }
}

impl std::fmt::Display for FlashStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FSR=0x{:08X} busy={} sqer={} proer={} proin={} rproin={}",
               self.0, self.is_busy(), self.get_sqer(), self.get_proer(),
               self.get_proin(), self.get_rproin())
    }
}

pub fn read_status<T: Target>(target: &mut T) -> Result<FlashStatus> {
    Ok(FlashStatus(target.read_u32(FSR)?))
}

/// Poll the status register until the controller is idle.
///
/// Sleeps `POLL_INTERVAL` between polls, giving up with `Timeout` after
/// `timeout` sleeps. A protection error reported once idle is returned as
/// `ProtectionViolation`.
pub fn wait_while_busy<T: Target>(target: &mut T, timeout: u32) -> Result<FlashStatus> {
    let mut remaining = timeout;
    let mut status = read_status(target)?;
    while status.is_busy() {
        if remaining == 0 {
            log::error!("Timed out waiting for flash ({})", status);
            return Err(Error::Timeout);
        }
        remaining -= 1;
        target.sleep(POLL_INTERVAL);
        status = read_status(target)?;
    }
    if status.get_proer() {
        log::error!("Flash protection error ({})", status);
        return Err(Error::ProtectionViolation);
    }
    Ok(status)
}

/// Clear error and status flags.
pub fn clear_status<T: Target>(target: &mut T) -> Result<()> {
    log::debug!("Clearing flash status");
    CommandSequence::clear_status().write(target)
}

#[test]
fn test_status_bits() {
    let status = FlashStatus((1 << 0) | (1 << 10) | (1 << 18) | (1 << 22) | (1 << 25));
    assert!(status.is_busy());
    assert!(status.get_sqer());
    assert!(!status.get_proer());
    assert!(status.get_rproin());
    assert!(status.get_wproin(1));
    assert!(!status.get_wproin(0));
    assert!(status.get_wprodis(0));
    assert!(!status.get_wprodis(1));
    assert!(!status.get_wprodis(2));
}
