//! NAND geometry, offset arithmetic, and an in-memory NAND for simulation

use std::io::{Read, Write};
use std::ops::Range;
use std::str::FromStr;

use anyhow::ensure;

use crate::error::GeometryError;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
///
/// `page_size` is the payload size addressed by the ISP agent; `real_page_size` includes the
/// out-of-band area and is only informational.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Geometry {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub page_size: usize,
    pub real_page_size: usize,
}

impl Geometry {
    /// Check that every field is usable for page/block arithmetic
    pub fn validate(self) -> Result<Self, GeometryError> {
        if self.blocks == 0 {
            return Err(GeometryError::Invalid("zero blocks"));
        }
        if self.pages_per_block == 0 {
            return Err(GeometryError::Invalid("zero pages per block"));
        }
        if self.page_size == 0 || self.page_size % 4 != 0 {
            return Err(GeometryError::Invalid("page size not a non-zero multiple of 4"));
        }
        if self.total_pages() > u64::from(u32::MAX) {
            return Err(GeometryError::Invalid("more pages than a page number can address"));
        }
        Ok(self)
    }

    pub fn block_size(&self) -> usize {
        self.pages_per_block as usize * self.page_size
    }

    pub fn total_pages(&self) -> u64 {
        u64::from(self.blocks) * u64::from(self.pages_per_block)
    }

    /// Payload capacity of the whole device in bytes
    pub fn total_size(&self) -> u64 {
        u64::from(self.blocks) * self.block_size() as u64
    }

    /// The block that contains `page`
    pub fn block_of(&self, page: u32) -> u32 {
        page / self.pages_per_block
    }

    /// The first page of `block`
    pub fn first_page_of(&self, block: u32) -> u32 {
        block * self.pages_per_block
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for Geometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, page_size]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let page_size = page_size.parse()?;

        Ok(Geometry {
            blocks,
            pages_per_block,
            page_size,
            real_page_size: page_size,
        }
        .validate()?)
    }
}

/// The blocks and pages covering a byte range of flash.
///
/// All `last_*` fields are inclusive.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct FlashOffsets {
    pub first_block: u32,
    pub last_block: u32,
    pub first_page: u32,
    pub last_page: u32,
}

impl FlashOffsets {
    /// Compute the covering range of `len` bytes at `offset`, which must lie within the device.
    /// An empty range is treated as covering the single byte at `offset`.
    pub fn new(geometry: &Geometry, offset: u64, len: u64) -> Result<Self, GeometryError> {
        let out_of_range = || GeometryError::OutOfRange {
            offset,
            len,
            size: geometry.total_size(),
        };

        let last = offset
            .checked_add(len.max(1) - 1)
            .filter(|&last| last < geometry.total_size())
            .ok_or_else(out_of_range)?;

        let unit = |byte: u64, size: usize| {
            u32::try_from(byte / size as u64).map_err(|_| out_of_range())
        };

        Ok(Self {
            first_block: unit(offset, geometry.block_size())?,
            last_block: unit(last, geometry.block_size())?,
            first_page: unit(offset, geometry.page_size)?,
            last_page: unit(last, geometry.page_size)?,
        })
    }

    pub fn block_count(&self) -> u32 {
        self.last_block - self.first_block + 1
    }

    pub fn page_count(&self) -> u32 {
        self.last_page - self.first_page + 1
    }

    /// Every page of every covered block
    pub fn block_pages(&self, geometry: &Geometry) -> Range<u32> {
        geometry.first_page_of(self.first_block)..geometry.first_page_of(self.last_block + 1)
    }

}

#[cfg(test)]
pub(crate) const TEST_GEOMETRY: Geometry = Geometry {
    blocks: 8,
    pages_per_block: 16,
    page_size: 256,
    real_page_size: 264,
};

#[test]
fn test_offsets_scenario() -> anyhow::Result<()> {
    let geometry = Geometry {
        blocks: 4096,
        pages_per_block: 64,
        page_size: 2048,
        real_page_size: 2112,
    };
    assert_eq!(geometry.block_size(), 131072);

    let fo = FlashOffsets::new(&geometry, 200_000, 5000)?;
    assert_eq!(fo.first_block, 1);
    assert_eq!(fo.last_block, 1);
    assert_eq!(fo.first_page, 97);
    // 204_999 / 2048 rounds down to 100
    assert_eq!(fo.last_page, 100);
    assert_eq!(fo.block_count(), 1);
    assert_eq!(fo.page_count(), 4);
    assert_eq!(fo.block_pages(&geometry), 64..128);
    Ok(())
}

#[test]
fn test_offsets_containment() -> anyhow::Result<()> {
    let geometry = TEST_GEOMETRY;
    let block_size = geometry.block_size() as u64;
    let page_size = geometry.page_size as u64;

    for offset in (0..3 * block_size).step_by(97) {
        for len in [1, 2, 255, 256, 257, 4095, 4096, 4097, 9000] {
            let fo = FlashOffsets::new(&geometry, offset, len)?;
            let last = offset + len - 1;

            assert!(u64::from(fo.first_block) * block_size <= offset);
            assert!(u64::from(fo.last_block + 1) * block_size > last);
            assert!(u64::from(fo.first_page) * page_size <= offset);
            assert!(u64::from(fo.last_page + 1) * page_size > last);

            let pages = fo.block_pages(&geometry);
            assert!(pages.contains(&fo.first_page));
            assert!(pages.contains(&fo.last_page));
        }
    }
    Ok(())
}

#[test]
fn test_offsets_out_of_range() {
    let geometry = TEST_GEOMETRY;
    let size = geometry.total_size();

    assert!(FlashOffsets::new(&geometry, size - 10, 10).is_ok());
    assert_eq!(
        FlashOffsets::new(&geometry, size - 10, 11),
        Err(GeometryError::OutOfRange {
            offset: size - 10,
            len: 11,
            size
        })
    );
    assert!(FlashOffsets::new(&geometry, size, 0).is_err());
}

#[test]
fn test_offsets_huge_offset_is_not_truncated() {
    let geometry = TEST_GEOMETRY;
    let block_size = geometry.block_size() as u64;

    // Block number 2^32 must not wrap around to block 0
    assert!(matches!(
        FlashOffsets::new(&geometry, block_size << 32, 1),
        Err(GeometryError::OutOfRange { .. })
    ));
    assert!(matches!(
        FlashOffsets::new(&geometry, u64::MAX, 2),
        Err(GeometryError::OutOfRange { .. })
    ));
    assert!(matches!(
        FlashOffsets::new(&geometry, u64::MAX, 0),
        Err(GeometryError::OutOfRange { .. })
    ));
}

#[test]
fn test_geometry_page_numbers_fit() {
    let geometry = Geometry {
        blocks: 1 << 16,
        pages_per_block: 1 << 16,
        page_size: 256,
        real_page_size: 256,
    };
    assert!(geometry.validate().is_err());
    assert!(Geometry { blocks: (1 << 16) - 1, ..geometry }.validate().is_ok());
}

#[test]
fn test_geometry_from_str() {
    let geometry: Geometry = "8x16x256".parse().unwrap();
    assert_eq!(geometry.blocks, 8);
    assert_eq!(geometry.pages_per_block, 16);
    assert_eq!(geometry.page_size, 256);

    assert!("8x16".parse::<Geometry>().is_err());
    assert!("8x0x256".parse::<Geometry>().is_err());
    assert!("8x16x255".parse::<Geometry>().is_err());
}

#[test]
fn test_sim_program_clears_bits_only() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    let mut page = vec![0; TEST_GEOMETRY.page_size];

    nand.read_page(3, &mut page)?;
    assert!(page.is_erased());

    nand.program_page(3, &vec![0xF0; TEST_GEOMETRY.page_size])?;
    nand.program_page(3, &vec![0x3C; TEST_GEOMETRY.page_size])?;
    nand.read_page(3, &mut page)?;
    assert!(page.iter().all(|&x| x == 0x30));

    nand.erase_block(5)?;
    nand.read_page(3, &mut page)?;
    assert!(page.is_erased());
    Ok(())
}

#[test]
fn test_sim_bounds() {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    let mut page = vec![0; TEST_GEOMETRY.page_size];

    assert!(nand.read_page(8 * 16, &mut page).is_err());
    assert!(nand.read_page(0, &mut page[..10]).is_err());
    assert!(nand.erase_block(8 * 16).is_err());
}

#[test]
fn test_sim_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    nand.load(&mut std::io::repeat(0x55u8))?;

    let mut buf = vec![0u8; TEST_GEOMETRY.page_size];
    nand.read_page(TEST_GEOMETRY.pages_per_block * 3 + 2, &mut buf)?;
    assert!(buf.iter().all(|&x| x == 0x55u8));
    Ok(())
}
