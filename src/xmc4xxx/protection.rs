//! User protection levels, PROCON registers and user configuration blocks.

use std::convert::TryFrom;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use super::{Error, Result, FlashController, status::FlashStatus};

/// PROCON registers for user levels 0, 1 and 2.
pub const PROCON: [u32; 3] = [0x5800_2020, 0x5800_2024, 0x5800_2028];

/// Read protection bit, meaningful in PROCON0 only.
pub const PROCON_RPRO: u32 = 1 << 15;

/// Written over the PROCON copies to make an installed configuration permanent.
pub const CONFIRMATION_CODE: u32 = 0x8AFE_15C3;

/// Number of 32-bit words in a user configuration block image.
pub const UCB_WORDS: usize = 8;

/// Write protection owners, from lowest to highest priority.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum UserLevel {
    User0 = 0,
    User1 = 1,
    /// One-time programmable, cannot be removed.
    User2 = 2,
}

impl UserLevel {
    pub fn from_index(level: u32) -> Result<Self> {
        u8::try_from(level).ok()
            .and_then(|l| UserLevel::try_from(l).ok())
            .ok_or(Error::InvalidUserLevel(level))
    }

    pub fn index(&self) -> u32 {
        u8::from(*self) as u32
    }

    /// Offset of this level's user configuration block from the bank base.
    pub fn ucb_offset(&self) -> u32 {
        self.index() * 0x400
    }

    /// True if the status register shows protection installed for this level.
    ///
    /// Read protection counts as installed for User0.
    pub fn is_installed(&self, status: FlashStatus) -> bool {
        match self {
            UserLevel::User0 => status.get_rproin() || status.get_wproin(0),
            UserLevel::User1 => status.get_wproin(1),
            UserLevel::User2 => status.get_wproin(2),
        }
    }
}

/// Passwords guarding User0 and User1 protection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Passwords {
    pub pw1: u32,
    pub pw2: u32,
}

/// Protection state recorded for a bank by `protect_check`.
#[derive(Clone, Debug, Default)]
pub struct Protection {
    pub passwords: Option<Passwords>,
    pub read_protected: bool,
    /// Per-sector OTP write protection.
    pub otp: Vec<bool>,
}

impl Protection {
    pub fn passwords(&self) -> Result<Passwords> {
        self.passwords.ok_or(Error::PasswordsNotSet)
    }

    pub fn otp_sectors(&self) -> Vec<usize> {
        self.otp.iter().enumerate().filter(|(_, &otp)| otp).map(|(i, _)| i).collect()
    }
}

/// Sector protection decoded from the three PROCON registers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtectionMap {
    pub protected: Vec<bool>,
    pub otp: Vec<bool>,
    pub read_protected: bool,
}

/// Decode PROCON0/1/2 into per-sector flags.
pub fn decode_procon(controller: FlashController, procon: [u32; 3]) -> ProtectionMap {
    let count = controller.num_sectors();
    let mut map = ProtectionMap {
        protected: vec![false; count],
        otp: vec![false; count],
        read_protected: procon[0] & PROCON_RPRO != 0,
    };
    for (level, &bits) in procon.iter().enumerate() {
        for bit in 0..controller.protection_bits() {
            if bits & (1 << bit) == 0 {
                continue;
            }
            let shared = controller == FlashController::Sectors12 && bit == 10;
            let sectors = if shared { bit..=bit + 1 } else { bit..=bit };
            for sector in sectors {
                map.protected[sector] = true;
                if level == 2 {
                    map.otp[sector] = true;
                }
            }
        }
    }
    map
}

/// Build the PROCON value protecting sectors `first` to `last` inclusive.
///
/// The caller has checked the range against the bank.
pub fn encode_procon(controller: FlashController, first: usize, last: usize, read_protect: bool)
    -> Result<u32>
{
    let mut procon = 0;
    for sector in first..=last {
        let bit = match controller {
            FlashController::Sectors12 if sector == 11 => {
                log::warn!("Sector 11 shares its protection bit with sector 10");
                10
            },
            _ => sector,
        };
        if bit == 15 {
            // Bit 15 is RPRO; there is no sector protection bit for it.
            return Err(Error::InvalidProtectionRequest(
                format!("sector {} has no write protection bit", sector)));
        }
        procon |= 1 << bit;
    }
    if read_protect {
        procon |= PROCON_RPRO;
    }
    Ok(procon)
}

/// Build the user configuration block image for `procon`.
///
/// The PROCON copies in words 0 and 2 are then overwritten by the
/// confirmation code.
pub fn ucb_image(procon: u32, passwords: Passwords) -> [u32; UCB_WORDS] {
    let mut ucb = [0u32; UCB_WORDS];
    ucb[0] = procon;
    ucb[2] = procon;
    ucb[4] = passwords.pw1;
    ucb[5] = passwords.pw2;
    ucb[6] = passwords.pw1;
    ucb[7] = passwords.pw2;
    ucb[0] = CONFIRMATION_CODE;
    ucb[2] = CONFIRMATION_CODE;
    ucb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_12_sector_aliasing() {
        let map = decode_procon(FlashController::Sectors12, [1 << 10, 0, 0]);
        assert_eq!(map.protected.iter().filter(|&&p| p).count(), 2);
        assert!(map.protected[10] && map.protected[11]);
        assert!(!map.read_protected);

        // Bit 11 is ignored on 12-sector parts.
        let map = decode_procon(FlashController::Sectors12, [1 << 11, 0, 0]);
        assert!(!map.protected.iter().any(|&p| p));
    }

    #[test]
    fn test_decode_levels() {
        let map = decode_procon(FlashController::Sectors9, [PROCON_RPRO | 1, 1 << 3, 1 << 8]);
        assert!(map.read_protected);
        assert!(map.protected[0] && map.protected[3] && map.protected[8]);
        assert_eq!(map.otp, vec![false, false, false, false, false, false, false, false, true]);

        // No aliasing outside 12-sector parts.
        let map = decode_procon(FlashController::Sectors16, [1 << 10, 0, 1 << 10]);
        assert!(map.protected[10] && !map.protected[11]);
        assert!(map.otp[10] && !map.otp[11]);
    }

    #[test]
    fn test_encode_procon() {
        let c = FlashController::Sectors8;
        assert_eq!(encode_procon(c, 0, 0, false).unwrap(), 1);
        assert_eq!(encode_procon(c, 2, 4, true).unwrap(), 0b11100 | PROCON_RPRO);

        let c = FlashController::Sectors12;
        assert_eq!(encode_procon(c, 9, 11, false).unwrap(), (1 << 9) | (1 << 10));

        let c = FlashController::Sectors16;
        assert_eq!(encode_procon(c, 0, 14, false).unwrap(), 0x7FFF);
        assert!(matches!(encode_procon(c, 14, 15, false),
                         Err(Error::InvalidProtectionRequest(_))));
    }

    #[test]
    fn test_ucb_image() {
        let pw = Passwords { pw1: 0x1111_1111, pw2: 0x2222_2222 };
        let ucb = ucb_image(0x0000_0003, pw);
        assert_eq!(ucb, [
            CONFIRMATION_CODE, 0, CONFIRMATION_CODE, 0,
            0x1111_1111, 0x2222_2222, 0x1111_1111, 0x2222_2222,
        ]);
    }

    #[test]
    fn test_user_level() {
        assert_eq!(UserLevel::from_index(1).unwrap(), UserLevel::User1);
        assert!(matches!(UserLevel::from_index(3), Err(Error::InvalidUserLevel(3))));
        assert_eq!(UserLevel::User2.ucb_offset(), 0x800);
        assert!(UserLevel::User0.is_installed(FlashStatus(1 << 18)));
        assert!(!UserLevel::User1.is_installed(FlashStatus(1 << 21)));
    }
}
