use super::protection::Protection;

/// Device and silicon revision decoded from the SCU chip ID.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub chip_id: u32,
    pub device: &'static str,
    pub revision: Option<&'static str>,
}

impl DeviceInfo {
    /// Decode `chip_id`, returning None for parts outside the family.
    pub fn from_chip_id(chip_id: u32) -> Option<Self> {
        let rev_id = chip_id & 0xF;
        let (device, revision) = match (chip_id & 0xFFF0) >> 4 {
            0x100 => ("XMC4100", match rev_id { 1 => Some("AA"), 2 => Some("AB"), _ => None }),
            0x200 => ("XMC4200", match rev_id { 1 => Some("AA"), 2 => Some("AB"), _ => None }),
            0x300 => ("XMC4300", match rev_id { 1 => Some("AA"), _ => None }),
            0x400 => ("XMC4400", match rev_id { 1 => Some("AA"), 2 => Some("AB"), _ => None }),
            // Early engineering samples report zero.
            0x000 => ("XMC4500 EES", Some("AA13")),
            0x500 => ("XMC4500", match rev_id {
                2 => Some("AA"), 3 => Some("AB"), 4 => Some("AC"), _ => None,
            }),
            0x700 => ("XMC4700", match rev_id { 1 => Some("EES-AA"), _ => None }),
            0x800 => ("XMC4800", match rev_id { 1 => Some("EES-AA"), _ => None }),
            _ => return None,
        };
        Some(DeviceInfo { chip_id, device, revision })
    }

    pub fn rev_id(&self) -> u32 {
        self.chip_id & 0xF
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.revision {
            Some(rev) => write!(f, "{} - Rev: {}", self.device, rev),
            None => write!(f, "{} - Rev: unknown (0x{:01x})", self.device, self.rev_id()),
        }
    }
}

/// Describe the device and any recorded read or OTP protection.
pub fn describe(chip_id: u32, protection: &Protection) -> String {
    let info = match DeviceInfo::from_chip_id(chip_id) {
        Some(info) => info,
        None => return format!("Cannot identify target as an XMC4xxx. SCU_ID: {:x}", chip_id),
    };
    let mut out = info.to_string();
    if protection.read_protected {
        out.push_str("\nFlash is read protected");
    }
    let otp = protection.otp_sectors();
    if !otp.is_empty() {
        out.push_str("\nOTP Protection is enabled for sectors:");
        for sector in otp {
            out.push_str(&format!("\n- {}", sector));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_info() {
        let info = DeviceInfo::from_chip_id(0x0004_5004).unwrap();
        assert_eq!(info.device, "XMC4500");
        assert_eq!(info.revision, Some("AC"));
        assert_eq!(info.to_string(), "XMC4500 - Rev: AC");

        let info = DeviceInfo::from_chip_id(0x0004_1009).unwrap();
        assert_eq!(info.to_string(), "XMC4100 - Rev: unknown (0x9)");

        assert_eq!(DeviceInfo::from_chip_id(0).unwrap().device, "XMC4500 EES");
        assert!(DeviceInfo::from_chip_id(0x0004_9001).is_none());
    }

    #[test]
    fn test_describe() {
        let protection = Protection {
            passwords: None,
            read_protected: true,
            otp: vec![false, true, false, true],
        };
        assert_eq!(describe(0x0004_4001, &protection),
                   "XMC4400 - Rev: AA\nFlash is read protected\n\
                    OTP Protection is enabled for sectors:\n- 1\n- 3");
        assert!(describe(0x0004_9001, &protection).starts_with("Cannot identify"));
    }
}
