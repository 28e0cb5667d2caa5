//! A simulated SPMP8000 ISP agent.
//!
//! [SimDevice] speaks the CBW/CSW protocol over the [Channel] trait and services the commands
//! against a [SimNand] and a sparse RAM. It is what the tests run against, and what the CLI uses
//! when asked to work on a NAND image instead of real hardware.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::{trace, warn};

use crate::device::{NandConfig, DEVICE_ID_ADDR, DEVICE_ID_LEN};
use crate::error::ChannelError;
use crate::nand::{Geometry, SimNand};
use crate::transport::{Cbw, Channel, Csw, DekuContainerRead, DekuContainerWrite, Direction};
use crate::transport::{Opcode, CBW_LEN, CBW_SIGNATURE};

/// The identity block reported by every simulated device
pub const SIM_DEVICE_ID: [u8; DEVICE_ID_LEN] = *b"SPMP8000";

const STATUS_OK: u8 = 0;
const STATUS_FAILED: u8 = 1;

/// Where the device is within a transaction
#[derive(Debug)]
enum Stage {
    /// Waiting for a CBW
    Idle,
    /// CBW received, waiting for `length` bytes of host data
    DataOut(Cbw),
    /// Response data queued for the host, followed by the status
    DataIn(Vec<u8>, Csw),
    /// Only the status is left
    Status(Csw),
}

#[derive(Debug)]
pub struct SimDevice {
    nand: SimNand,
    ram: HashMap<u32, u8>,
    config: NandConfig,
    dram_init_config: Option<NandConfig>,
    stage: Stage,
    transactions: Vec<(Opcode, u32)>,
    failing_reads: HashSet<u32>,
    failing_writes: HashSet<u32>,
    failing_erases: HashSet<u32>,
    weak_pages: HashMap<u32, u32>,
    corrupt_next_status: bool,
}

impl SimDevice {
    /// A device with an erased NAND of the given geometry
    pub fn new(geometry: Geometry) -> Self {
        Self::with_nand(SimNand::new(geometry))
    }

    pub fn with_nand(nand: SimNand) -> Self {
        let mut device = Self {
            config: NandConfig::for_geometry(&nand.geometry()),
            nand,
            ram: HashMap::new(),
            dram_init_config: None,
            stage: Stage::Idle,
            transactions: Vec::new(),
            failing_reads: HashSet::new(),
            failing_writes: HashSet::new(),
            failing_erases: HashSet::new(),
            weak_pages: HashMap::new(),
            corrupt_next_status: false,
        };
        device.write_ram(DEVICE_ID_ADDR, &SIM_DEVICE_ID);
        device
    }

    pub fn nand(&self) -> &SimNand {
        &self.nand
    }

    pub fn nand_mut(&mut self) -> &mut SimNand {
        &mut self.nand
    }

    pub fn into_nand(self) -> SimNand {
        self.nand
    }

    /// The configuration record the device currently reports
    pub fn config(&self) -> &NandConfig {
        &self.config
    }

    /// Report `config` once a DRAM init command has been run
    pub fn set_dram_init_config(&mut self, config: NandConfig) {
        self.dram_init_config = Some(config);
    }

    pub fn write_ram(&mut self, addr: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            self.ram.insert(addr.wrapping_add(i as u32), byte);
        }
    }

    /// Every command received so far, with its address field
    pub fn transactions(&self) -> &[(Opcode, u32)] {
        &self.transactions
    }

    /// Make the data phase of every read of `page` time out
    pub fn fail_reads_of(&mut self, page: u32) {
        self.failing_reads.insert(page);
    }

    /// Make the data phase of every program of `page` time out, leaving the page untouched
    pub fn fail_writes_of(&mut self, page: u32) {
        self.failing_writes.insert(page);
    }

    /// Stop answering every erase of `block`, so the host times out waiting for the status
    pub fn fail_erases_of(&mut self, block: u32) {
        self.failing_erases.insert(block);
    }

    /// Make the next `times` programs of `page` store corrupted data
    pub fn weaken_page(&mut self, page: u32, times: u32) {
        self.weak_pages.insert(page, times);
    }

    /// Send a status block with a broken signature for the next transaction
    pub fn corrupt_next_status(&mut self) {
        self.corrupt_next_status = true;
    }

    fn status(&mut self, tag: u32, ok: bool) -> Csw {
        let mut csw = Csw::new(tag, if ok { STATUS_OK } else { STATUS_FAILED });
        if std::mem::take(&mut self.corrupt_next_status) {
            csw.signature = 0xDEAD_BEEF;
        }
        csw
    }

    fn accept_cbw(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let Ok((_, cbw)) = Cbw::from_bytes((data, 0)) else {
            return Err(ChannelError::Disconnected);
        };
        if data.len() != CBW_LEN || cbw.signature != CBW_SIGNATURE {
            warn!("sim: ignoring invalid CBW");
            return Err(ChannelError::Disconnected);
        }

        let Some(opcode) = Opcode::from_code(cbw.opcode) else {
            warn!("sim: unknown opcode {:#06x}", cbw.opcode);
            let csw = self.status(cbw.tag, false);
            self.stage = Stage::Status(csw);
            return Ok(());
        };
        trace!("sim: {opcode:?} @ {:#x}, len {:#x}", cbw.address, cbw.transfer_length);
        self.transactions.push((opcode, cbw.address));

        if opcode == Opcode::FlashBlockErase
            && self
                .failing_erases
                .contains(&self.nand.geometry().block_of(cbw.address))
        {
            // No status will follow
            return Ok(());
        }

        self.stage = match (cbw.direction(), cbw.transfer_length) {
            (Direction::Out, 1..) => Stage::DataOut(cbw),
            (Direction::In, 1..) => {
                let mut response = vec![0u8; cbw.transfer_length as usize];
                let ok = self.service_in(opcode, cbw.address, &mut response);
                Stage::DataIn(response, self.status(cbw.tag, ok))
            }
            (_, 0) => {
                let ok = self.service_out(opcode, cbw.address, &[]);
                Stage::Status(self.status(cbw.tag, ok))
            }
        };
        Ok(())
    }

    /// Handle a device-to-host command, filling `response`
    fn service_in(&mut self, opcode: Opcode, addr: u32, response: &mut [u8]) -> bool {
        match opcode {
            Opcode::RamRead => {
                for (i, byte) in response.iter_mut().enumerate() {
                    *byte = self
                        .ram
                        .get(&addr.wrapping_add(i as u32))
                        .copied()
                        .unwrap_or(0);
                }
                true
            }
            Opcode::FlashConfigRead => match self.config.to_bytes() {
                Ok(bytes) => {
                    let len = std::cmp::min(bytes.len(), response.len());
                    response[..len].copy_from_slice(&bytes[..len]);
                    true
                }
                Err(_) => false,
            },
            Opcode::FlashRead => self.nand.read_page(addr, response).is_ok(),
            _ => false,
        }
    }

    /// Handle a host-to-device command, or one without a data phase
    fn service_out(&mut self, opcode: Opcode, addr: u32, data: &[u8]) -> bool {
        match opcode {
            Opcode::RamWrite => {
                self.write_ram(addr, data);
                true
            }
            Opcode::FlashConfigSend => match NandConfig::from_bytes((data, 0)) {
                Ok((_, config)) => {
                    self.config = config;
                    true
                }
                Err(_) => false,
            },
            Opcode::FlashWrite => {
                let mut content = data.to_vec();
                if let Some(times) = self.weak_pages.get_mut(&addr) {
                    if *times > 0 {
                        *times -= 1;
                        if let Some(byte) = content.first_mut() {
                            *byte ^= 0x01;
                        }
                    }
                }
                self.nand.program_page(addr, &content).is_ok()
            }
            Opcode::FlashBlockErase => self.nand.erase_block(addr).is_ok(),
            Opcode::DramInit => {
                if let Some(config) = self.dram_init_config.take() {
                    self.config = config;
                }
                true
            }
            _ => false,
        }
    }
}

impl Channel for SimDevice {
    fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, ChannelError> {
        match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Idle => self.accept_cbw(data)?,
            Stage::DataOut(cbw) => {
                let failing_write = Opcode::from_code(cbw.opcode) == Some(Opcode::FlashWrite)
                    && self.failing_writes.contains(&cbw.address);
                if failing_write {
                    return Err(ChannelError::Timeout);
                }
                if data.len() != cbw.transfer_length as usize {
                    return Err(ChannelError::ShortTransfer {
                        expected: cbw.transfer_length as usize,
                        actual: data.len(),
                    });
                }
                // The opcode was validated when the CBW arrived
                let ok = Opcode::from_code(cbw.opcode)
                    .map_or(false, |op| self.service_out(op, cbw.address, data));
                self.stage = Stage::Status(self.status(cbw.tag, ok));
            }
            Stage::DataIn(..) | Stage::Status(_) => return Err(ChannelError::Timeout),
        }
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, ChannelError> {
        match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::DataIn(response, csw) => {
                let reading_failed_page = self
                    .transactions
                    .last()
                    .is_some_and(|&(op, page)| {
                        op == Opcode::FlashRead && self.failing_reads.contains(&page)
                    });
                if reading_failed_page {
                    return Err(ChannelError::Timeout);
                }

                let len = std::cmp::min(buf.len(), response.len());
                buf[..len].copy_from_slice(&response[..len]);
                self.stage = Stage::Status(csw);
                Ok(len)
            }
            Stage::Status(csw) => {
                let bytes = csw.to_bytes().map_err(|_| ChannelError::Disconnected)?;
                let len = std::cmp::min(buf.len(), bytes.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(len)
            }
            Stage::Idle | Stage::DataOut(_) => Err(ChannelError::Timeout),
        }
    }
}
