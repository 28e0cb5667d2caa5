//! The command/status transport spoken by the SPMP8000 ISP agent.
//!
//! Every transaction follows the same three stages, borrowed from USB mass storage:
//!
//! ```text
//!   host                                   device
//!    |  -- CBW (31 bytes) ----------------->  |
//!    |  -- data (out) --> / <-- data (in) --  |   optional, `length` bytes
//!    |  <-------------------- CSW (13 bytes)  |
//! ```
//!
//! All CBW fields are little-endian except the address, which the agent decodes big-endian.

pub mod usb;

use std::time::Duration;

pub use deku::{DekuContainerRead, DekuContainerWrite};
use deku::prelude::*;
use log::{trace, warn};

use crate::error::{ChannelError, ProtocolError, Result};
use crate::IspError;

/// Little-endian "USBC"
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// Little-endian "USBS"
pub const CSW_SIGNATURE: u32 = 0x5342_5355;
pub const CBW_TAG: u32 = 0x1234_5678;
pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;
const CB_LENGTH: u8 = 10;

/// Default per-transfer timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A bidirectional bulk channel to the device.
///
/// Both calls return the number of bytes actually moved; the transport decides whether a short
/// count is acceptable.
pub trait Channel {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ChannelError>;
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError>;
}

impl<C: Channel + ?Sized> Channel for &mut C {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ChannelError> {
        (**self).send(data, timeout)
    }
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        (**self).receive(buf, timeout)
    }
}

/// Vendor opcodes understood by the ISP agent. The wire value is `(sub << 8) | 0xC2`.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum Opcode {
    BypassBootrom = 0x00,
    RamWrite = 0x01,
    RamRead = 0x02,
    Execute = 0x05,
    BootromVersion = 0x06,
    DramInit = 0x07,
    FlashConfigRead = 0x10,
    FlashBlockErase = 0x11,
    FlashWrite = 0x12,
    FlashRead = 0x13,
    FlashConfigSend = 0x20,
    FlashWriteAlt = 0x30,
    FlashReadAlt = 0x31,
}

impl Opcode {
    const ALL: [Opcode; 13] = [
        Opcode::BypassBootrom,
        Opcode::RamWrite,
        Opcode::RamRead,
        Opcode::Execute,
        Opcode::BootromVersion,
        Opcode::DramInit,
        Opcode::FlashConfigRead,
        Opcode::FlashBlockErase,
        Opcode::FlashWrite,
        Opcode::FlashRead,
        Opcode::FlashConfigSend,
        Opcode::FlashWriteAlt,
        Opcode::FlashReadAlt,
    ];

    pub fn code(self) -> u32 {
        ((self as u32) << 8) | 0xC2
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }
}

/// Direction of a transaction's data phase, as carried in the CBW flag byte
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn flag(self) -> u8 {
        match self {
            Direction::Out => 0x00,
            Direction::In => 0x80,
        }
    }
}

/// The optional data phase of a transaction. There is no shape for a combined read and write.
#[derive(Debug)]
pub enum DataPhase<'a> {
    /// No data is moved; the direction is still reported to the device
    Empty(Direction),
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl DataPhase<'_> {
    pub fn direction(&self) -> Direction {
        match self {
            DataPhase::Empty(direction) => *direction,
            DataPhase::In(_) => Direction::In,
            DataPhase::Out(_) => Direction::Out,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DataPhase::Empty(_) => 0,
            DataPhase::In(buf) => buf.len(),
            DataPhase::Out(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Command block wrapper
#[derive(Debug, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Cbw {
    pub signature: u32,
    pub tag: u32,
    pub transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub opcode: u32,
    #[deku(endian = "big")]
    pub address: u32,
    pub reserved: [u8; 8],
}

impl Cbw {
    pub fn new(opcode: Opcode, address: u32, transfer_length: u32, direction: Direction) -> Self {
        Self {
            signature: CBW_SIGNATURE,
            tag: CBW_TAG,
            transfer_length,
            flags: direction.flag(),
            lun: 0,
            cb_length: CB_LENGTH,
            opcode: opcode.code(),
            address,
            reserved: [0; 8],
        }
    }

    pub fn direction(&self) -> Direction {
        match self.flags & 0x80 {
            0 => Direction::Out,
            _ => Direction::In,
        }
    }
}

/// Command status wrapper
#[derive(Debug, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Csw {
    pub signature: u32,
    pub tag: u32,
    pub residue: u32,
    pub status: u8,
}

impl Csw {
    pub fn new(tag: u32, status: u8) -> Self {
        Self {
            signature: CSW_SIGNATURE,
            tag,
            residue: 0,
            status,
        }
    }
}

/// Frames transactions over a [Channel]. Holds no state between calls besides the timeout.
#[derive(Debug)]
pub struct Transport<C> {
    channel: C,
    timeout: Duration,
}

impl<C: Channel> Transport<C> {
    pub fn new(channel: C, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Run one complete transaction: CBW, optional data phase, CSW.
    ///
    /// Nothing is retried here; any channel failure or invalid status block fails the call.
    pub fn execute(&mut self, opcode: Opcode, address: u32, phase: DataPhase<'_>) -> Result<()> {
        let length = u32::try_from(phase.len()).map_err(|_| IspError::Buffer {
            needed: phase.len(),
            actual: u32::MAX as usize,
        })?;

        trace!(
            "txn: op {:#06x}, addr {address:#010x}, len {length:#x}, {:?}",
            opcode.code(),
            phase.direction()
        );

        let cbw = Cbw::new(opcode, address, length, phase.direction()).to_bytes()?;
        self.send_all(&cbw)?;

        match phase {
            DataPhase::In(buf) if !buf.is_empty() => self.receive_exact(buf)?,
            DataPhase::Out(buf) if !buf.is_empty() => self.send_all(buf)?,
            _ => (),
        }

        let mut status = [0u8; CSW_LEN];
        let received = self.channel.receive(&mut status, self.timeout)?;
        if received < CSW_LEN {
            return Err(ProtocolError::ShortStatus(received).into());
        }

        let (_, csw) = Csw::from_bytes((&status[..], 0))?;
        if csw.signature != CSW_SIGNATURE {
            return Err(ProtocolError::Signature(csw.signature).into());
        }

        // The agent's status byte and residue are informational only
        if csw.status != 0 {
            warn!(
                "device reported status {:#04x} (residue {}) for op {:#06x}",
                csw.status,
                csw.residue,
                opcode.code()
            );
        }

        Ok(())
    }

    fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let sent = self.channel.send(data, self.timeout)?;
        if sent != data.len() {
            return Err(ChannelError::ShortTransfer {
                expected: data.len(),
                actual: sent,
            }
            .into());
        }
        Ok(())
    }

    fn receive_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let received = self.channel.receive(buf, self.timeout)?;
        if received != buf.len() {
            return Err(ChannelError::ShortTransfer {
                expected: buf.len(),
                actual: received,
            }
            .into());
        }
        Ok(())
    }
}
