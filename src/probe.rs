//! USB transport to CMSIS-DAP probes.
//!
//! Finds probes on the bus and moves raw CMSIS-DAP packets to and from them.
//! CMSIS-DAPv2 probes are driven over their bulk endpoints with `rusb`;
//! CMSIS-DAPv1 probes fall back to HID reports through `hidapi`.

use std::time::Duration;
use thiserror::Error;
use rusb::{Device, Context, UsbContext};
use hidapi::HidApi;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid probe specifier, use VID:PID, VID:PID:Serial or VID:PID:Serial:v1.")]
    InvalidSpecifier,
    #[error("specified probe not found.")]
    NotFound,
    #[error("no CMSIS-DAP probes found.")]
    NoProbesFound,
    #[error("multiple CMSIS-DAP probes found, select one with --probe.")]
    MultipleProbesFound,
    #[error("USB error")]
    USB(#[from] rusb::Error),
    #[error("USB HID error")]
    HID(#[from] hidapi::HidError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Timeout for descriptor reads while enumerating devices.
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(100);

/// Timeout waiting for a response packet.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Timeout for a request packet to be accepted.
const WRITE_TIMEOUT: Duration = Duration::from_millis(10);

/// Most CMSIS-DAPv1 firmware uses 64-byte HID reports.
const DEFAULT_REPORT_SIZE: usize = 64;

/// An open CMSIS-DAP probe.
pub enum Probe {
    /// CMSIS-DAPv1, HID reports.
    V1 {
        device: hidapi::HidDevice,
        report_size: usize,
    },

    /// CMSIS-DAPv2, vendor bulk interface.
    V2 {
        handle: rusb::DeviceHandle<rusb::Context>,
        out_ep: u8,
        in_ep: u8,
        max_packet_size: usize,
    },
}

impl Probe {
    /// Open the only connected probe.
    ///
    /// Fails when no probe, or more than one probe, is attached.
    pub fn new() -> Result<Probe> {
        log::debug!("Opening the single connected probe");
        let mut probes = ProbeInfo::list();
        match probes.len() {
            0 => Err(Error::NoProbesFound),
            1 => probes.remove(0).open(),
            _ => Err(Error::MultipleProbesFound),
        }
    }

    /// Current packet size in bytes.
    pub fn packet_size(&self) -> usize {
        match self {
            Probe::V1 { report_size, .. } => *report_size,
            Probe::V2 { max_packet_size, .. } => *max_packet_size,
        }
    }

    /// Update the packet size after querying it with DAP_Info.
    ///
    /// Only HID probes are affected: their report size cannot be read from
    /// USB descriptors, while bulk probes already report the right size.
    pub fn set_packet_size(&mut self, packet_size: usize) {
        if let Probe::V1 { report_size, .. } = self {
            *report_size = packet_size;
        }
    }

    /// Try to claim the CMSIS-DAPv2 interface of `device`.
    fn from_device(device: Device<Context>) -> Result<Probe> {
        log::trace!("Trying CMSIS-DAPv2 interface on {:?}", device);
        let mut handle = device.open()?;
        let language = match handle.read_languages(DESCRIPTOR_TIMEOUT)?.first() {
            Some(language) => *language,
            None => return Err(Error::NotFound),
        };
        let cdesc = device.config_descriptor(0)?;
        for interface in cdesc.interfaces() {
            for idesc in interface.descriptors() {
                match handle.read_interface_string(language, &idesc, DESCRIPTOR_TIMEOUT) {
                    Ok(istr) if istr.contains("CMSIS-DAP") => (),
                    _ => continue,
                }

                // Bulk OUT, bulk IN, and an optional SWO endpoint.
                let eps: Vec<_> = idesc.endpoint_descriptors().collect();
                if eps.len() < 2 || eps.len() > 3 {
                    continue;
                }
                let is_bulk = |ep: &rusb::EndpointDescriptor, dir| {
                    ep.transfer_type() == rusb::TransferType::Bulk && ep.direction() == dir
                };
                if !is_bulk(&eps[0], rusb::Direction::Out) || !is_bulk(&eps[1], rusb::Direction::In) {
                    continue;
                }

                if handle.claim_interface(interface.number()).is_ok() {
                    log::debug!("Opened CMSIS-DAPv2 probe {:?}", device);
                    return Ok(Probe::V2 {
                        handle,
                        out_ep: eps[0].address(),
                        in_ep: eps[1].address(),
                        max_packet_size: eps[1].max_packet_size() as usize,
                    });
                }
            }
        }
        Err(Error::NotFound)
    }

    /// Try to open `info` as a CMSIS-DAPv1 HID device.
    fn from_hid(info: &ProbeInfo) -> Result<Probe> {
        log::trace!("Trying CMSIS-DAPv1 HID access to {}", info);
        let api = HidApi::new()?;
        let device = match &info.sn {
            Some(sn) => api.open_serial(info.vid, info.pid, sn),
            None => api.open(info.vid, info.pid),
        }.map_err(|_| Error::NotFound)?;
        match device.get_product_string() {
            Ok(Some(s)) if s.contains("CMSIS-DAP") => {
                log::debug!("Opened CMSIS-DAPv1 probe {}", info);
                Ok(Probe::V1 { device, report_size: DEFAULT_REPORT_SIZE })
            },
            _ => Err(Error::NotFound),
        }
    }

    /// Discard any stale response data left in the probe.
    pub fn drain(&self) -> Result<()> {
        log::trace!("Draining probe");
        let mut buf = vec![0u8; 1024];
        match self {
            Probe::V1 { device, report_size } => {
                while device.read_timeout(&mut buf[..*report_size], 1)? > 0 {}
            },
            Probe::V2 { handle, in_ep, .. } => loop {
                match handle.read_bulk(*in_ep, &mut buf[..], Duration::from_millis(1)) {
                    Ok(n) if n > 0 => continue,
                    Ok(_) | Err(rusb::Error::Timeout) => break,
                    Err(e) => return Err(e.into()),
                }
            },
        }
        Ok(())
    }

    /// Read one response packet.
    pub fn read(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.packet_size()];
        let n = match self {
            Probe::V1 { device, .. } =>
                device.read_timeout(&mut buf[..], READ_TIMEOUT.as_millis() as i32)?,
            Probe::V2 { handle, in_ep, .. } =>
                handle.read_bulk(*in_ep, &mut buf[..], READ_TIMEOUT)?,
        };
        buf.truncate(n);
        log::trace!("RX: {:02X?}", buf);
        Ok(buf)
    }

    /// Send one request packet.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        log::trace!("TX: {:02X?}", buf);
        match self {
            Probe::V1 { device, report_size } => {
                // HID needs a leading report ID and a full-size report.
                let mut report = Vec::with_capacity(report_size + 1);
                report.push(0);
                report.extend_from_slice(buf);
                report.resize(report_size + 1, 0);
                Ok(device.write(&report)?)
            },
            Probe::V2 { handle, out_ep, .. } => Ok(handle.write_bulk(*out_ep, buf, WRITE_TIMEOUT)?),
        }
    }
}

/// Identifying details of a CMSIS-DAP probe.
///
/// Used both to list attached probes and to select one from the command line.
#[derive(Clone, Debug)]
pub struct ProbeInfo {
    pub name: Option<String>,
    pub vid: u16,
    pub pid: u16,
    pub sn: Option<String>,
    pub v1_only: bool,
}

impl ProbeInfo {
    /// List all attached CMSIS-DAP probes.
    pub fn list() -> Vec<Self> {
        log::trace!("Enumerating CMSIS-DAP probes");
        match Context::new().and_then(|ctx| ctx.devices()) {
            Ok(devices) => devices.iter().filter_map(|d| Self::from_device(&d)).collect(),
            Err(_) => vec![],
        }
    }

    /// Parse a `VID:PID[:SN[:v1]]` specifier, with VID and PID in hex.
    pub fn from_specifier(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(Error::InvalidSpecifier);
        }
        let vid = u16::from_str_radix(parts[0], 16).map_err(|_| Error::InvalidSpecifier)?;
        let pid = u16::from_str_radix(parts[1], 16).map_err(|_| Error::InvalidSpecifier)?;
        let sn = parts.get(2).filter(|sn| !sn.is_empty()).map(|sn| sn.to_string());
        let v1_only = match parts.get(3) {
            None => false,
            Some(&"v1") => true,
            Some(_) => return Err(Error::InvalidSpecifier),
        };
        Ok(ProbeInfo { name: None, vid, pid, sn, v1_only })
    }

    /// Open the probe described by this ProbeInfo.
    ///
    /// The bulk interface is preferred; HID is used if it cannot be claimed.
    pub fn open(&self) -> Result<Probe> {
        log::trace!("Opening probe {}", self);
        if !self.v1_only {
            if let Ok(devices) = Context::new().and_then(|ctx| ctx.devices()) {
                for device in devices.iter() {
                    let matched = Self::from_device(&device).map(|info| info.matches(self));
                    if matched == Some(true) {
                        if let Ok(probe) = Probe::from_device(device) {
                            return Ok(probe);
                        }
                    }
                }
            }
        }
        Probe::from_hid(self)
    }

    /// Build a ProbeInfo for `device` if its product string names CMSIS-DAP.
    fn from_device(device: &Device<Context>) -> Option<ProbeInfo> {
        let desc = device.device_descriptor().ok()?;
        let handle = device.open().ok()?;
        let language = *handle.read_languages(DESCRIPTOR_TIMEOUT).ok()?.first()?;
        let name = handle.read_product_string(language, &desc, DESCRIPTOR_TIMEOUT).ok()?;
        if !name.contains("CMSIS-DAP") {
            return None;
        }
        let sn = handle.read_serial_number_string(language, &desc, DESCRIPTOR_TIMEOUT).ok();
        Some(ProbeInfo {
            name: Some(name),
            vid: desc.vendor_id(),
            pid: desc.product_id(),
            sn,
            v1_only: false,
        })
    }

    /// True if this probe satisfies `target`; the serial is only compared if given.
    fn matches(&self, target: &Self) -> bool {
        self.vid == target.vid
            && self.pid == target.pid
            && (target.sn.is_none() || self.sn == target.sn)
    }
}

impl std::fmt::Display for ProbeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.name.as_deref().unwrap_or("Unknown");
        let sn = self.sn.as_deref().unwrap_or("");
        write!(f, "{:04x}:{:04x}:{} {}", self.vid, self.pid, sn, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specifier() {
        let info = ProbeInfo::from_specifier("0d28:0204").unwrap();
        assert_eq!((info.vid, info.pid), (0x0d28, 0x0204));
        assert!(info.sn.is_none());
        assert!(!info.v1_only);

        let info = ProbeInfo::from_specifier("1209:4853:ABC123:v1").unwrap();
        assert_eq!(info.sn.as_deref(), Some("ABC123"));
        assert!(info.v1_only);

        assert!(ProbeInfo::from_specifier("1209").is_err());
        assert!(ProbeInfo::from_specifier("xyz:4853").is_err());
        assert!(ProbeInfo::from_specifier("1209:4853:ABC:v2").is_err());
    }
}
