use std::convert::TryFrom;
use num_enum::TryFromPrimitive;
use super::Sector;

/// Flash ID register; the controller identity is in bits 23:16.
pub const FLASH_ID: u32 = 0x5800_2008;

/// SCU chip ID register.
pub const SCU_IDCHIP: u32 = 0x5000_4004;

/// Flash controller identities, each implying a sector layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FlashController {
    /// XMC4100/4200.
    Sectors8 = 0x9C,
    /// XMC4400.
    Sectors9 = 0x9F,
    /// XMC4500, 1MB.
    Sectors12 = 0xA2,
    /// XMC4300/4700/4800, 2MB.
    Sectors16 = 0x92,
}

impl FlashController {
    /// Extract the controller from a FLASH_ID register value.
    pub fn from_register(value: u32) -> Option<Self> {
        Self::try_from(((value >> 16) & 0xFF) as u8).ok()
    }

    pub fn num_sectors(&self) -> usize {
        self.capacities_kb().len()
    }

    pub fn devices(&self) -> &'static str {
        match self {
            FlashController::Sectors8  => "XMC4100/4200",
            FlashController::Sectors9  => "XMC4400",
            FlashController::Sectors12 => "XMC4500",
            FlashController::Sectors16 => "XMC4300/4700/4800",
        }
    }

    /// Sector sizes in kB, in address order.
    pub fn capacities_kb(&self) -> &'static [u32] {
        match self {
            FlashController::Sectors8 =>
                &[16, 16, 16, 16, 16, 16, 16, 128],
            FlashController::Sectors9 =>
                &[16, 16, 16, 16, 16, 16, 16, 128, 256],
            FlashController::Sectors12 =>
                &[16, 16, 16, 16, 16, 16, 16, 16, 128, 256, 256, 256],
            FlashController::Sectors16 =>
                &[16, 16, 16, 16, 16, 16, 16, 16, 128, 256, 256, 256, 256, 256, 256, 256],
        }
    }

    /// Number of PROCON bits that map to sectors.
    ///
    /// On 12-sector parts sectors 10 and 11 share bit 10.
    pub fn protection_bits(&self) -> usize {
        match self {
            FlashController::Sectors12 => self.num_sectors() - 1,
            _ => self.num_sectors(),
        }
    }

    /// Build the sector table with cumulative offsets.
    pub fn sectors(&self) -> Vec<Sector> {
        let mut offset = 0;
        self.capacities_kb().iter().map(|&kb| {
            let size = kb * 1024;
            let sector = Sector { offset, size, is_protected: None, is_erased: None };
            offset += size;
            sector
        }).collect()
    }

    pub fn total_size(&self) -> u32 {
        self.capacities_kb().iter().sum::<u32>() * 1024
    }
}

/// True for chip IDs belonging to the XMC4000 family.
///
/// Early XMC4500 engineering samples report an all-zero ID.
pub fn is_xmc4000(chip_id: u32) -> bool {
    (chip_id & 0xF_0000) == 0x4_0000 || chip_id == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layouts() {
        let cases = [
            (0x9C, 8, 240),
            (0x9F, 9, 496),
            (0xA2, 12, 1024),
            (0x92, 16, 2048),
        ];
        for &(id, count, kb) in cases.iter() {
            let controller = FlashController::from_register((id as u32) << 16).unwrap();
            let sectors = controller.sectors();
            assert_eq!(sectors.len(), count);
            assert_eq!(controller.total_size(), kb * 1024);
            assert_eq!(sectors[0].offset, 0);
            for pair in sectors.windows(2) {
                assert_eq!(pair[1].offset, pair[0].offset + pair[0].size);
            }
            let last = sectors.last().unwrap();
            assert_eq!(last.offset + last.size, kb * 1024);
        }
    }

    #[test]
    fn test_unknown_controller() {
        assert!(FlashController::from_register(0x00AB_0000).is_none());
        assert!(FlashController::from_register(0).is_none());
        // Other bits of the register are ignored.
        assert_eq!(FlashController::from_register(0xFF9C_1234), Some(FlashController::Sectors8));
    }

    #[test]
    fn test_family() {
        assert!(is_xmc4000(0x0004_5004));
        assert!(is_xmc4000(0));
        assert!(!is_xmc4000(0x0001_3004));
    }
}
