//! The NAND configuration record exchanged with the ISP agent.
//!
//! Depending on the romboot version, the same record also lives in device RAM (0x9D805300 on v4,
//! 0x9D805820 on v3), but the dedicated command works on both.

use std::fmt;

use deku::prelude::*;

use crate::error::GeometryError;
use crate::nand::Geometry;

pub const NAND_CONFIG_LEN: usize = 0x40;

#[derive(Debug, Default, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct NandConfig {
    pub pages_per_block: u16,
    /// Page size including the out-of-band area
    pub real_page_size: u16,
    /// Page size as addressed by the flash read/write commands
    pub payload_len: u16,
    pub reserved1: [u16; 3],
    pub total_blocks: u16,
    pub reserved2: u8,
    pub ecc_mode: u8,
    pub reserved3: [u8; 16],
    pub flash_id1: [u8; 16],
    pub flash_id2: [u8; 16],
}

impl NandConfig {
    /// Configuration for the Micron 29F32G08 part found in the Letcool tablets. That device needs
    /// it sent before flash access works in ISP mode.
    pub const MICRON_29F32G08: NandConfig = NandConfig {
        pages_per_block: 128,
        real_page_size: 0x1080,
        payload_len: 0x1000,
        reserved1: [0x0080, 0x0020, 0x0020],
        total_blocks: 0x2000,
        reserved2: 0x0D,
        ecc_mode: 0,
        reserved3: [
            0x00, 0x00, 0x00, 0x00, 0x5d, 0xf0, 0x07, 0x00, 0x80, 0x00, 0x05, 0x00, 0x05, 0x00,
            0x00, 0x00,
        ],
        flash_id1: [
            0x2c, 0xd7, 0x94, 0x3e, 0x84, 0x00, 0x00, 0x00, 0x2c, 0xd7, 0x94, 0x3e, 0x84, 0x00,
            0x00, 0x00,
        ],
        flash_id2: [
            0x2c, 0xd7, 0x94, 0x3e, 0x84, 0x00, 0x00, 0x00, 0x2c, 0xd7, 0x94, 0x3e, 0x84, 0x00,
            0x00, 0x00,
        ],
    };

    /// Build a record describing `geometry`, with everything else zeroed
    pub fn for_geometry(geometry: &Geometry) -> Self {
        Self {
            pages_per_block: geometry.pages_per_block as u16,
            real_page_size: geometry.real_page_size as u16,
            payload_len: geometry.page_size as u16,
            total_blocks: geometry.blocks as u16,
            ..Default::default()
        }
    }

    /// Extract the flash geometry, rejecting records with zeroed fields
    pub fn geometry(&self) -> Result<Geometry, GeometryError> {
        Geometry {
            blocks: self.total_blocks.into(),
            pages_per_block: self.pages_per_block.into(),
            page_size: self.payload_len.into(),
            real_page_size: self.real_page_size.into(),
        }
        .validate()
    }
}

impl fmt::Display for NandConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_kib = u64::from(self.total_blocks)
            * u64::from(self.pages_per_block)
            * u64::from(self.payload_len)
            / 1024;
        let id = &self.flash_id1[..8];

        writeln!(f, "Pages per block:        {}", self.pages_per_block)?;
        writeln!(f, "Real page size:         {}", self.real_page_size)?;
        writeln!(f, "Page size:              {}", self.payload_len)?;
        writeln!(f, "Total number of blocks: {}", self.total_blocks)?;
        writeln!(f, "ECC mode:               {}", self.ecc_mode)?;
        writeln!(f, "Total size:             {total_kib} KiB")?;
        write!(
            f,
            "NAND ID:                {}",
            id.iter()
                .map(|b| format!("{b:02X}"))
                .collect::<Vec<_>>()
                .join("-")
        )
    }
}
