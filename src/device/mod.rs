//! The ISP agent's command set, and the session state (flash geometry) needed to use it.

mod config;

pub use config::{NandConfig, NAND_CONFIG_LEN};

use std::time::Duration;

use log::{debug, info};

use crate::error::{GeometryError, Result};
use crate::nand::Geometry;
use crate::transport::{Channel, DataPhase, DekuContainerRead, DekuContainerWrite};
use crate::transport::{Direction, Opcode, Transport, DEFAULT_TIMEOUT};
use crate::IspError;

/// Where the romboot code leaves the 8-byte device identity
pub const DEVICE_ID_ADDR: u32 = 0x9D80_0010;
pub const DEVICE_ID_LEN: usize = 8;

/// Location and size of the boot ROM itself
pub const ROMBOOT_ADDR: u32 = 0x9800_0000;
pub const ROMBOOT_LEN: usize = 64 * 1024;

/// Knobs for a session, chosen by the caller instead of living in global state
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Run the DRAM init code staged in flash before anything else
    pub init_dram: bool,

    /// Configuration record to send before reading back the geometry
    pub flash_config: Option<NandConfig>,

    /// Extra attempts (re-erase and re-program) for a block that fails verification
    pub write_retries: usize,

    /// Timeout applied to every bulk transfer
    pub timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            init_dram: false,
            flash_config: None,
            write_retries: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// One open channel to the ISP agent, plus the flash geometry read from it
#[derive(Debug)]
pub struct Session<C> {
    transport: Transport<C>,
    geometry: Option<Geometry>,
    options: SessionOptions,
}

impl<C: Channel> Session<C> {
    /// Wrap a channel without talking to the device. Page and block operations will fail until
    /// [Session::get_flash_info] succeeds or a geometry is set.
    pub fn new(channel: C, options: SessionOptions) -> Self {
        Self {
            transport: Transport::new(channel, options.timeout),
            geometry: None,
            options,
        }
    }

    /// Wrap a channel and run the usual setup sequence: optional DRAM init, optional flash
    /// configuration upload, then geometry discovery.
    pub fn open(channel: C, options: SessionOptions) -> Result<Self> {
        let mut session = Self::new(channel, options);

        if session.options.init_dram {
            session.init_dram()?;
            info!("DRAM init called");
        }

        if let Some(config) = session.options.flash_config.clone() {
            session.write_flash_config(&config)?;
            info!("Flash config sent");
        }

        session.get_flash_info()?;
        Ok(session)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn channel(&self) -> &C {
        self.transport.channel()
    }

    pub fn channel_mut(&mut self) -> &mut C {
        self.transport.channel_mut()
    }

    pub fn into_channel(self) -> C {
        self.transport.into_channel()
    }

    /// The current geometry, or [GeometryError::Unknown] before discovery
    pub fn geometry(&self) -> Result<Geometry> {
        self.geometry.ok_or(GeometryError::Unknown.into())
    }

    /// Establish the geometry without asking the device
    pub fn set_geometry(&mut self, geometry: Geometry) -> Result<()> {
        self.geometry = Some(geometry.validate()?);
        Ok(())
    }

    fn page_size(&self) -> Result<usize> {
        Ok(self.geometry()?.page_size)
    }

    /// Read the raw flash configuration record
    pub fn read_flash_config(&mut self) -> Result<NandConfig> {
        let mut buf = [0u8; NAND_CONFIG_LEN];
        self.transport
            .execute(Opcode::FlashConfigRead, 0, DataPhase::In(&mut buf))?;
        let (_, config) = NandConfig::from_bytes((&buf[..], 0))?;
        Ok(config)
    }

    /// Send a flash configuration record; the agent applies it immediately
    pub fn write_flash_config(&mut self, config: &NandConfig) -> Result<()> {
        let buf = config.to_bytes()?;
        self.transport
            .execute(Opcode::FlashConfigSend, 0, DataPhase::Out(&buf))
    }

    /// Read the flash configuration and adopt its geometry for this session
    pub fn get_flash_info(&mut self) -> Result<NandConfig> {
        let config = self.read_flash_config()?;
        let geometry = config.geometry()?;

        debug!(
            "flash geometry: {} blocks x {} pages x {} bytes ({} with OOB)",
            geometry.blocks, geometry.pages_per_block, geometry.page_size, geometry.real_page_size
        );
        self.geometry = Some(geometry);
        Ok(config)
    }

    /// Have the boot ROM load and run the DRAM init code from flash. This also reprograms the
    /// NAND timings, so the geometry should be read again afterwards.
    pub fn init_dram(&mut self) -> Result<()> {
        self.transport
            .execute(Opcode::DramInit, 0, DataPhase::Empty(Direction::In))
    }

    pub fn read_mem(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.transport
            .execute(Opcode::RamRead, addr, DataPhase::In(buf))
    }

    pub fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.transport
            .execute(Opcode::RamWrite, addr, DataPhase::Out(data))
    }

    /// Read a large span of memory in page-sized transactions (or 4 KiB ones before the
    /// geometry is known)
    pub fn read_mem_chunked(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let chunk = self.geometry.map_or(4096, |g| g.page_size);

        let mut offset = 0usize;
        for piece in buf.chunks_mut(chunk) {
            let len = piece.len();
            self.read_mem(addr.wrapping_add(offset as u32), piece)?;
            offset += len;
        }
        Ok(())
    }

    /// Read one page into the start of `buf`, which must hold at least a page
    pub fn read_flash_page(&mut self, page: u32, buf: &mut [u8]) -> Result<()> {
        let page_size = self.page_size()?;
        let actual = buf.len();
        let buf = buf.get_mut(..page_size).ok_or(IspError::Buffer {
            needed: page_size,
            actual,
        })?;
        self.transport
            .execute(Opcode::FlashRead, page, DataPhase::In(buf))
    }

    /// Program one page from the start of `data`, which must hold at least a page
    pub fn write_flash_page(&mut self, page: u32, data: &[u8]) -> Result<()> {
        let page_size = self.page_size()?;
        let data = data.get(..page_size).ok_or(IspError::Buffer {
            needed: page_size,
            actual: data.len(),
        })?;
        self.transport
            .execute(Opcode::FlashWrite, page, DataPhase::Out(data))
    }

    /// Erase the block containing `page`
    pub fn erase_block(&mut self, page: u32) -> Result<()> {
        self.geometry()?;
        self.transport
            .execute(Opcode::FlashBlockErase, page, DataPhase::Empty(Direction::Out))
    }

    pub fn read_device_id(&mut self) -> Result<[u8; DEVICE_ID_LEN]> {
        let mut id = [0u8; DEVICE_ID_LEN];
        self.read_mem(DEVICE_ID_ADDR, &mut id)?;
        Ok(id)
    }

    /// Dump the boot ROM
    pub fn read_romboot(&mut self) -> Result<Vec<u8>> {
        let mut rom = vec![0u8; ROMBOOT_LEN];
        self.read_mem_chunked(ROMBOOT_ADDR, &mut rom)?;
        Ok(rom)
    }

    /// Read `count` consecutive pages starting at `first` into `buf`.
    ///
    /// Stops at the first failing page, reporting how many pages were read.
    pub fn read_flash_pages(&mut self, first: u32, count: u32, buf: &mut [u8]) -> Result<()> {
        let page_size = self.page_size()?;
        let needed = count as usize * page_size;
        let actual = buf.len();
        let buf = buf
            .get_mut(..needed)
            .ok_or(IspError::Buffer { needed, actual })?;

        for (page, chunk) in (first..first + count).zip(buf.chunks_exact_mut(page_size)) {
            self.read_flash_page(page, chunk)
                .map_err(|e| aborted(page - first, e))?;
        }
        Ok(())
    }

    /// Program `count` consecutive pages starting at `first` from `data`.
    ///
    /// Stops at the first failing page; pages already written stay written.
    pub fn write_flash_pages(&mut self, first: u32, count: u32, data: &[u8]) -> Result<()> {
        let page_size = self.page_size()?;
        let needed = count as usize * page_size;
        let data = data.get(..needed).ok_or(IspError::Buffer {
            needed,
            actual: data.len(),
        })?;

        for (page, chunk) in (first..first + count).zip(data.chunks_exact(page_size)) {
            self.write_flash_page(page, chunk)
                .map_err(|e| aborted(page - first, e))?;
        }
        Ok(())
    }

    /// Erase `count` consecutive blocks, the first of which contains `first_page`.
    ///
    /// Stops at the first failing block; blocks already erased stay erased.
    pub fn erase_blocks(&mut self, first_page: u32, count: u32) -> Result<()> {
        let pages_per_block = self.geometry()?.pages_per_block;

        for i in 0..count {
            self.erase_block(first_page + i * pages_per_block)
                .map_err(|e| aborted(i, e))?;
        }
        Ok(())
    }
}

fn aborted(completed: u32, source: IspError) -> IspError {
    IspError::Aborted {
        completed,
        source: Box::new(source),
    }
}
