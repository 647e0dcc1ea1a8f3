//! The DAP module implements the CMSIS-DAP commands needed to drive an SWD
//! debug port, formatting them into packets exchanged through the Probe module.

use std::{time::Duration, thread};
use thiserror::Error;
use num_enum::IntoPrimitive;
use crate::probe::{Probe, Error as ProbeError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Probe error")]
    Probe(#[from] ProbeError),
    #[error("Probe does not support SWD mode.")]
    NoSWD,
    #[error("Invalid response from probe.")]
    InvalidResponse,
    #[error("Probe reported error during connect.")]
    Connection,
    #[error("Probe reported error setting clock frequency.")]
    Clock,
    #[error("Probe reported error while running SWJ sequence.")]
    SWJSequence,
    #[error("Probe reported error configuring transfers.")]
    TransferConfigure,
    #[error("Target returned WAIT for too long.")]
    TransferWait,
    #[error("Target returned FAULT.")]
    TransferFault,
    #[error("SWD protocol error (no ACK or parity error).")]
    TransferProtocol,
    #[error("Only {done} of {requested} transfers completed.")]
    TransferIncomplete { done: usize, requested: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct DAP {
    probe: Probe,
    packet_size: usize,
}

impl DAP {
    pub fn new(probe: Probe) -> Result<DAP> {
        // Stale data from an earlier session would desynchronise the
        // request/response stream, so flush it before the first request.
        probe.drain()?;

        let mut dap = DAP { probe, packet_size: 0 };

        dap.packet_size = dap.get_packet_size()?;
        dap.probe.set_packet_size(dap.packet_size);

        if !dap.has_swd()? {
            return Err(Error::NoSWD);
        }

        dap.connect()?;
        dap.set_led(true)?;

        // 2 idle cycles after each transfer, generous WAIT retries.
        dap.transfer_configure(2, 0x1000, 0)?;
        dap.swd_configure(0)?;

        Ok(dap)
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    fn has_swd(&self) -> Result<bool> {
        log::debug!("Checking probe for SWD support");
        let response = self.execute(Command::DAP_Info, &[DAPInfoID::Capabilities.into()])?;
        match response.get(1) {
            Some(1) | Some(2) => Ok((response[2] & 0b01) == 0b01),
            _ => Err(Error::InvalidResponse),
        }
    }

    fn get_packet_size(&self) -> Result<usize> {
        log::debug!("Requesting maximum packet size");
        let response = self.execute(Command::DAP_Info, &[DAPInfoID::MaxPacketSize.into()])?;
        match response.get(1) {
            Some(2) => {
                let size = u16::from_le_bytes([response[2], response[3]]);
                log::trace!("Got packet size {} bytes", size);
                Ok(size as usize)
            },
            _ => Err(Error::InvalidResponse),
        }
    }

    fn connect(&self) -> Result<()> {
        log::debug!("Connecting to target in SWD mode");
        let response = self.execute(Command::DAP_Connect, &[ConnectPort::SWD.into()])?;
        match response.get(1) {
            Some(&port) if port == ConnectPort::SWD.into() => Ok(()),
            _ => Err(Error::Connection),
        }
    }

    fn disconnect(&self) -> Result<()> {
        log::debug!("Disconnecting from target");
        let response = self.execute(Command::DAP_Disconnect, &[])?;
        self.check_status(&response, Error::Connection)
    }

    pub fn set_led(&self, state: bool) -> Result<()> {
        log::trace!("Setting probe LED to {}", state);
        self.execute(Command::DAP_HostStatus, &[HostStatusType::Connect.into(), state as u8])?;
        Ok(())
    }

    fn set_nrst(&self, state: bool) -> Result<()> {
        log::trace!("Setting nRST to {}", state);
        let state = (state as u8) << 7;
        let select = 1 << 7;
        self.execute(Command::DAP_SWJ_Pins, &[state, select, 0, 0, 0, 0])?;
        Ok(())
    }

    pub fn pulse_nrst(&self, duration: Duration) -> Result<()> {
        log::debug!("Pulsing nRST");
        self.set_nrst(false)?;
        thread::sleep(duration);
        self.set_nrst(true)?;
        Ok(())
    }

    pub fn set_clock(&self, freq: u32) -> Result<()> {
        log::debug!("Setting clock to {}Hz", freq);
        let response = self.execute(Command::DAP_SWJ_Clock, &freq.to_le_bytes())?;
        self.check_status(&response, Error::Clock)
    }

    /// Clock out `nbits` bits of `data` on SWDIO, least significant bit first.
    pub fn swj_sequence(&self, nbits: u8, data: &[u8]) -> Result<()> {
        log::trace!("SWJ sequence of {} bits", nbits);
        let mut request = vec![nbits];
        request.extend_from_slice(data);
        let response = self.execute(Command::DAP_SWJ_Sequence, &request)?;
        self.check_status(&response, Error::SWJSequence)
    }

    fn transfer_configure(&self, idle_cycles: u8, wait_retry: u16, match_retry: u16)
        -> Result<()>
    {
        log::debug!("Configuring transfers: idle={} wait_retry={}", idle_cycles, wait_retry);
        let mut request = vec![idle_cycles];
        request.extend_from_slice(&wait_retry.to_le_bytes());
        request.extend_from_slice(&match_retry.to_le_bytes());
        let response = self.execute(Command::DAP_TransferConfigure, &request)?;
        self.check_status(&response, Error::TransferConfigure)
    }

    fn swd_configure(&self, config: u8) -> Result<()> {
        let response = self.execute(Command::DAP_SWD_Configure, &[config])?;
        self.check_status(&response, Error::TransferConfigure)
    }

    /// Run a list of single register transfers.
    ///
    /// Returns the values read by any read requests, in order.
    pub fn transfer(&self, requests: &[Transfer]) -> Result<Vec<u32>> {
        let mut request = vec![0, requests.len() as u8];
        let mut nreads = 0;
        for transfer in requests {
            request.push(transfer.request_byte());
            match transfer {
                Transfer::Read { .. } => nreads += 1,
                Transfer::Write { value, .. } => request.extend_from_slice(&value.to_le_bytes()),
            }
        }
        let response = self.execute(Command::DAP_Transfer, &request)?;
        if response.len() < 3 {
            return Err(Error::InvalidResponse);
        }
        check_ack(response[2])?;
        let done = response[1] as usize;
        if done != requests.len() {
            return Err(Error::TransferIncomplete { done, requested: requests.len() });
        }
        let data = &response[3..];
        if data.len() < nreads * 4 {
            return Err(Error::InvalidResponse);
        }
        Ok(data.chunks_exact(4).take(nreads)
               .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]])).collect())
    }

    /// Number of words that fit in a single DAP_TransferBlock packet.
    pub fn block_words(&self) -> usize {
        (self.packet_size - 5) / 4
    }

    /// Read `count` words from one register with DAP_TransferBlock.
    pub fn transfer_block_read(&self, port: Port, register: u8, count: usize)
        -> Result<Vec<u32>>
    {
        let header = Transfer::Read { port, register }.request_byte();
        let mut request = vec![0];
        request.extend_from_slice(&(count as u16).to_le_bytes());
        request.push(header);
        let response = self.execute(Command::DAP_TransferBlock, &request)?;
        let data = self.check_block(&response, count)?;
        if data.len() < count * 4 {
            return Err(Error::InvalidResponse);
        }
        Ok(data.chunks_exact(4).take(count)
               .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]])).collect())
    }

    /// Write `values` to one register with DAP_TransferBlock.
    pub fn transfer_block_write(&self, port: Port, register: u8, values: &[u32]) -> Result<()> {
        let header = Transfer::Write { port, register, value: 0 }.request_byte();
        let mut request = vec![0];
        request.extend_from_slice(&(values.len() as u16).to_le_bytes());
        request.push(header);
        for value in values {
            request.extend_from_slice(&value.to_le_bytes());
        }
        let response = self.execute(Command::DAP_TransferBlock, &request)?;
        self.check_block(&response, values.len())?;
        Ok(())
    }

    fn check_block<'r>(&self, response: &'r [u8], count: usize) -> Result<&'r [u8]> {
        if response.len() < 4 {
            return Err(Error::InvalidResponse);
        }
        check_ack(response[3])?;
        let done = u16::from_le_bytes([response[1], response[2]]) as usize;
        if done != count {
            return Err(Error::TransferIncomplete { done, requested: count });
        }
        Ok(&response[4..])
    }

    fn check_status(&self, response: &[u8], error: Error) -> Result<()> {
        match response.get(1) {
            Some(&status) if status == ResponseStatus::DAP_OK.into() => Ok(()),
            _ => Err(error),
        }
    }

    fn execute(&self, command: Command, data: &[u8]) -> Result<Vec<u8>> {
        let command_id: u8 = command.into();
        let mut request = vec![command_id];
        request.extend_from_slice(data);
        self.probe.write(&request)?;
        let response = self.probe.read()?;
        match response.first() {
            Some(&id) if id == command_id => Ok(response),
            _ => Err(Error::InvalidResponse),
        }
    }
}

impl std::ops::Drop for DAP {
    fn drop(&mut self) {
        log::debug!("DAP dropped, disconnecting");
        self.disconnect().ok();
        self.set_led(false).ok();
    }
}

/// Decode the ACK field of a transfer response.
fn check_ack(ack: u8) -> Result<()> {
    match ack & 0b1111 {
        0b001 => Ok(()),
        0b010 => Err(Error::TransferWait),
        0b100 => Err(Error::TransferFault),
        _ => Err(Error::TransferProtocol),
    }
}

/// Which port a transfer addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Port {
    DP,
    AP,
}

/// A single SWD register transfer.
///
/// `register` is the byte address of the register within its 16-byte bank.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transfer {
    Read { port: Port, register: u8 },
    Write { port: Port, register: u8, value: u32 },
}

impl Transfer {
    fn request_byte(&self) -> u8 {
        let (port, register, read) = match *self {
            Transfer::Read { port, register } => (port, register, true),
            Transfer::Write { port, register, .. } => (port, register, false),
        };
        let mut byte = register & 0b1100;
        if port == Port::AP {
            byte |= 1 << 0;
        }
        if read {
            byte |= 1 << 1;
        }
        byte
    }
}

#[derive(Copy, Clone, IntoPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u8)]
enum Command {
    DAP_Info            = 0x00,
    DAP_HostStatus      = 0x01,
    DAP_Connect         = 0x02,
    DAP_Disconnect      = 0x03,
    DAP_TransferConfigure = 0x04,
    DAP_Transfer        = 0x05,
    DAP_TransferBlock   = 0x06,
    DAP_SWJ_Pins        = 0x10,
    DAP_SWJ_Clock       = 0x11,
    DAP_SWJ_Sequence    = 0x12,
    DAP_SWD_Configure   = 0x13,
}

#[derive(Copy, Clone, IntoPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u8)]
enum ResponseStatus {
    DAP_OK              = 0x00,
}

#[derive(Copy, Clone, IntoPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u8)]
enum DAPInfoID {
    Capabilities        = 0xF0,
    MaxPacketSize       = 0xFF,
}

#[derive(Copy, Clone, IntoPrimitive)]
#[repr(u8)]
enum HostStatusType {
    Connect             = 0,
}

#[derive(Copy, Clone, IntoPrimitive)]
#[repr(u8)]
enum ConnectPort {
    SWD                 = 1,
}

#[test]
fn test_request_byte() {
    assert_eq!(Transfer::Read { port: Port::DP, register: 0x0 }.request_byte(), 0b0010);
    assert_eq!(Transfer::Write { port: Port::DP, register: 0x8, value: 0 }.request_byte(), 0b1000);
    assert_eq!(Transfer::Read { port: Port::AP, register: 0xC }.request_byte(), 0b1111);
    assert_eq!(Transfer::Write { port: Port::AP, register: 0x4, value: 1 }.request_byte(), 0b0101);
}

#[test]
fn test_check_ack() {
    assert!(check_ack(0x01).is_ok());
    assert!(matches!(check_ack(0x02), Err(Error::TransferWait)));
    assert!(matches!(check_ack(0x04), Err(Error::TransferFault)));
    assert!(matches!(check_ack(0x09), Err(Error::TransferProtocol)));
}
