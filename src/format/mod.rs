//! The boot ROM locates bootable images ("bootfiles") through PAT pages. A PAT page is a flash
//! page made of little-endian 32-bit words:
//!
//! ```text
//! word 0     magic (0x55AACC33)
//! word 1     image id
//! word 2     image size in bytes
//! word 3     last data page + 1 (written, but not needed for parsing)
//! word 4..   absolute page numbers of the image, in order
//!            terminated by 0xFFFFFFFF, or by the end of the page
//! ```
//!
//! This module implements:
//! 1. Parsing and synthesizing PAT pages.
//! 2. Scanning a page range of the NAND for bootfiles.
//! 3. Reading a bootfile back, and writing a new bootfile together with its PAT page.

pub mod raw;

use std::fmt;
use std::mem::size_of;

use bytes::{BufMut, BytesMut};
use log::{debug, info, trace};

use crate::device::Session;
use crate::error::{GeometryError, Result};
use crate::nand::FlashOffsets;
use crate::transport::Channel;
use crate::IspError;

pub const PAT_MAGIC: u32 = 0x55AA_CC33;
pub const PAT_END: u32 = 0xFFFF_FFFF;

const PAT_POS_MAGIC: usize = 0;
const PAT_POS_ID: usize = 1;
const PAT_POS_SIZE: usize = 2;
const PAT_POS_FIRSTPAGE: usize = 4;

/// How many pages from the start of flash the boot ROM searches for PAT pages
pub const PAT_SEARCH_PAGES: u32 = 512;

/// Image id used when writing bootfiles
pub const DEFAULT_BOOTFILE_ID: u32 = 0x1984_BABE;

/// The identity of one bootfile, as described by its PAT page
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Bootfile {
    pub pat_page: u32,
    pub id: u32,
    pub size: u32,
    /// The image's pages, in order
    pub pages: Vec<u32>,
    /// `false` if the page list ran to the end of the PAT page without a terminator
    pub terminated: bool,
}

impl Bootfile {
    pub fn first_page(&self) -> Option<u32> {
        self.pages.first().copied()
    }

    pub fn last_page(&self) -> Option<u32> {
        self.pages.last().copied()
    }

    /// Are the image's pages laid out back-to-back?
    pub fn is_contiguous(&self) -> bool {
        self.pages.windows(2).all(|w| w[1] == w[0].wrapping_add(1))
    }
}

impl fmt::Display for Bootfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PAT page:    {:#010X}", self.pat_page)?;
        writeln!(f, "ID:          {:#010X}", self.id)?;
        writeln!(f, "Size:        {}", self.size)?;
        if let (Some(first), Some(last)) = (self.first_page(), self.last_page()) {
            writeln!(f, "First page:  {first:#010X}")?;
            write!(f, "Last page:   {last:#010X}")?;
        } else {
            write!(f, "No pages")?;
        }
        if !self.is_contiguous() {
            write!(f, "\nPages non-contiguous!")?;
        }
        if !self.terminated {
            write!(f, "\nPage list not terminated!")?;
        }
        Ok(())
    }
}

/// Read the `index`th little-endian word of a page
fn word(page: &[u8], index: usize) -> Option<u32> {
    let bytes = page.get(index * size_of::<u32>()..)?.get(..size_of::<u32>())?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// How many page numbers fit in one PAT page of `page_size` bytes
pub fn pat_capacity(page_size: usize) -> usize {
    (page_size / size_of::<u32>()).saturating_sub(PAT_POS_FIRSTPAGE)
}

/// Extract the bootfile described by `page`, read from flash page `pat_page`.
///
/// Returns `None` if the page is not a PAT page.
pub fn parse(pat_page: u32, page: &[u8]) -> Option<Bootfile> {
    if word(page, PAT_POS_MAGIC)? != PAT_MAGIC {
        return None;
    }

    let id = word(page, PAT_POS_ID)?;
    let size = word(page, PAT_POS_SIZE)?;

    let mut pages = Vec::new();
    let mut terminated = false;
    for index in PAT_POS_FIRSTPAGE..page.len() / size_of::<u32>() {
        match word(page, index)? {
            PAT_END => {
                terminated = true;
                break;
            }
            number => pages.push(number),
        }
    }

    Some(Bootfile {
        pat_page,
        id,
        size,
        pages,
        terminated,
    })
}

/// Synthesize the PAT page for a `size`-byte image stored contiguously from `data_page` on.
///
/// The terminator is omitted if the page list fills the page exactly.
pub fn build_page(page_size: usize, id: u32, data_page: u32, size: u32) -> Result<Vec<u8>> {
    if size == 0 {
        return Err(IspError::EmptyImage);
    }

    let pages = (size as usize).div_ceil(page_size);
    let max = pat_capacity(page_size);
    if pages > max {
        return Err(IspError::Capacity { pages, max });
    }

    // Bounded by the capacity check above
    let count = pages as u32;
    let end = data_page
        .checked_add(count)
        .ok_or(GeometryError::PageOverflow {
            first: data_page,
            count,
        })?;

    let mut pat = BytesMut::with_capacity(page_size);
    pat.put_u32_le(PAT_MAGIC);
    pat.put_u32_le(id);
    pat.put_u32_le(size);
    pat.put_u32_le(end);
    for page in data_page..end {
        pat.put_u32_le(page);
    }
    if pages < max {
        pat.put_u32_le(PAT_END);
    }
    pat.resize(page_size, 0xFF);

    Ok(pat.to_vec())
}

/// Read `pat_page` from flash and parse it.
///
/// A page that is not a PAT page is `Ok(None)`; only a failed read is an error.
pub fn read_bootfile_info<C: Channel>(
    session: &mut Session<C>,
    pat_page: u32,
) -> Result<Option<Bootfile>> {
    let mut buf = vec![0u8; session.geometry()?.page_size];
    session.read_flash_page(pat_page, &mut buf)?;

    let bootfile = parse(pat_page, &buf);
    if bootfile.is_none() {
        trace!("Page {pat_page:#x} is not a PAT page - magic word not found");
    }
    Ok(bootfile)
}

/// Find every bootfile whose PAT page lies in `first..first + count`
pub fn scan_range<C: Channel>(
    session: &mut Session<C>,
    first: u32,
    count: u32,
) -> Result<Vec<Bootfile>> {
    let rpt = howudoin::new()
        .label("Scanning for PAT pages")
        .set_len(u64::from(count));

    let mut found = Vec::new();
    for pat_page in first..first + count {
        match read_bootfile_info(session, pat_page) {
            Ok(Some(bootfile)) => {
                debug!("Bootfile {:#010x} found at page {pat_page:#x}", bootfile.id);
                found.push(bootfile);
            }
            Ok(None) => (),
            Err(e) => {
                rpt.close();
                return Err(e);
            }
        }
        rpt.inc();
    }

    rpt.close();
    Ok(found)
}

/// Find every bootfile in the part of the flash the boot ROM searches
pub fn scan<C: Channel>(session: &mut Session<C>) -> Result<Vec<Bootfile>> {
    let total = session.geometry()?.total_pages();
    let count = u64::from(PAT_SEARCH_PAGES).min(total) as u32;
    scan_range(session, 0, count)
}

/// Read the bootfile whose PAT page is `pat_page`, following its page list.
///
/// The image is returned rounded up to whole pages.
pub fn read_bootfile<C: Channel>(
    session: &mut Session<C>,
    pat_page: u32,
) -> Result<(Bootfile, Vec<u8>)> {
    let page_size = session.geometry()?.page_size;
    let bootfile =
        read_bootfile_info(session, pat_page)?.ok_or(IspError::Format { page: pat_page })?;

    let mut image = vec![0u8; bootfile.pages.len() * page_size];
    for (&page, chunk) in bootfile.pages.iter().zip(image.chunks_exact_mut(page_size)) {
        session.read_flash_page(page, chunk)?;
    }

    Ok((bootfile, image))
}

/// Write `data` as a bootfile starting at `data_page`, then its PAT page at `pat_page`.
///
/// The data goes first, so an interruption leaves at worst a stale or missing PAT page rather
/// than one pointing at unwritten data. The PAT page must not share a block with the data, as
/// writing either erases the whole block.
pub fn build_and_write<C: Channel>(
    session: &mut Session<C>,
    id: u32,
    pat_page: u32,
    data_page: u32,
    data: &[u8],
) -> Result<()> {
    let geometry = session.geometry()?;
    let page_size = geometry.page_size;

    let size = u32::try_from(data.len()).map_err(|_| IspError::Capacity {
        pages: data.len().div_ceil(page_size),
        max: pat_capacity(page_size),
    })?;
    let pat = build_page(page_size, id, data_page, size)?;

    // Both writes must fit before either starts
    let data_offset = u64::from(data_page) * page_size as u64;
    let pat_offset = u64::from(pat_page) * page_size as u64;
    let data_range = FlashOffsets::new(&geometry, data_offset, data.len() as u64)?;
    let pat_range = FlashOffsets::new(&geometry, pat_offset, page_size as u64)?;

    let pat_block = pat_range.first_block;
    if (data_range.first_block..=data_range.last_block).contains(&pat_block) {
        return Err(IspError::Overlap {
            pat_page,
            block: pat_block,
        });
    }

    info!("Writing {} bytes of bootfile data at page {data_page:#x}", data.len());
    raw::write_random(session, data_offset, data)?;

    info!("Writing PAT page {pat_page:#x}");
    raw::write_random(session, pat_offset, &pat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SessionOptions;
    use crate::nand::TEST_GEOMETRY;
    use crate::sim::SimDevice;
    use crate::transport::Opcode;

    const PAGE_SIZE: usize = 256;

    fn pat_words(words: &[u32]) -> Vec<u8> {
        let mut page = vec![0xFF; PAGE_SIZE];
        for (i, w) in words.iter().enumerate() {
            page[i * 4..][..4].copy_from_slice(&w.to_le_bytes());
        }
        page
    }

    fn session(device: &mut SimDevice) -> Session<&mut SimDevice> {
        Session::open(device, SessionOptions::default()).unwrap()
    }

    #[test]
    fn test_parse() {
        let page = pat_words(&[PAT_MAGIC, 0xABCD, 600, 13, 10, 11, 12, PAT_END, 99]);
        let bootfile = parse(7, &page).unwrap();

        assert_eq!(bootfile.pat_page, 7);
        assert_eq!(bootfile.id, 0xABCD);
        assert_eq!(bootfile.size, 600);
        assert_eq!(bootfile.first_page(), Some(10));
        assert_eq!(bootfile.last_page(), Some(12));
        assert!(bootfile.terminated);
        assert!(bootfile.is_contiguous());
    }

    #[test]
    fn test_parse_wrong_magic() {
        let page = pat_words(&[0x55AA_CC34, 1, 2, 3, 4, PAT_END]);
        assert_eq!(parse(0, &page), None);
        assert_eq!(parse(0, &[0x33, 0xCC]), None);
    }

    #[test]
    fn test_parse_unterminated() {
        let mut words = vec![PAT_MAGIC, 1, 2, 3];
        words.extend(100..100 + pat_capacity(PAGE_SIZE) as u32);
        let bootfile = parse(0, &pat_words(&words)).unwrap();

        assert!(!bootfile.terminated);
        assert_eq!(bootfile.pages.len(), pat_capacity(PAGE_SIZE));
        assert_eq!(bootfile.last_page(), Some(100 + 59));
        assert!(bootfile.to_string().contains("not terminated"));
    }

    #[test]
    fn test_parse_non_contiguous() {
        let page = pat_words(&[PAT_MAGIC, 1, 1024, 0, 40, 41, 60, 61, PAT_END]);
        let bootfile = parse(0, &page).unwrap();
        assert!(!bootfile.is_contiguous());
        assert!(bootfile.to_string().contains("non-contiguous"));
    }

    #[test]
    fn test_build_page() -> anyhow::Result<()> {
        let page = build_page(PAGE_SIZE, 0x1984_BABE, 10, 600)?;
        assert_eq!(page, pat_words(&[PAT_MAGIC, 0x1984_BABE, 600, 13, 10, 11, 12, PAT_END]));

        let bootfile = parse(3, &page).unwrap();
        assert_eq!(bootfile.pages, [10, 11, 12]);
        Ok(())
    }

    #[test]
    fn test_build_page_capacity() {
        let max = pat_capacity(PAGE_SIZE);
        assert_eq!(max, PAGE_SIZE / 4 - 4);

        // A full list leaves no room for the terminator
        let full = build_page(PAGE_SIZE, 1, 0, (max * PAGE_SIZE) as u32).unwrap();
        let bootfile = parse(0, &full).unwrap();
        assert_eq!(bootfile.pages.len(), max);
        assert!(!bootfile.terminated);

        assert!(matches!(
            build_page(PAGE_SIZE, 1, 0, (max * PAGE_SIZE + 1) as u32),
            Err(IspError::Capacity { pages, max: m }) if pages == max + 1 && m == max
        ));
        assert!(matches!(
            build_page(PAGE_SIZE, 1, 0, 0),
            Err(IspError::EmptyImage)
        ));
    }

    #[test]
    fn test_scan_range() -> anyhow::Result<()> {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        let nand = device.nand_mut();
        nand.program_page(2, &pat_words(&[PAT_MAGIC, 1, 256, 41, 40, PAT_END]))?;
        nand.program_page(5, &pat_words(&[0x12345678, 1, 256, 41, 40, PAT_END]))?;
        nand.program_page(9, &pat_words(&[PAT_MAGIC, 2, 512, 50, 48, 49, PAT_END]))?;

        let mut session = session(&mut device);
        let found = scan_range(&mut session, 0, 16)?;
        assert_eq!(found.len(), 2);
        assert_eq!((found[0].pat_page, found[0].id), (2, 1));
        assert_eq!((found[1].pat_page, found[1].pages.clone()), (9, vec![48, 49]));
        Ok(())
    }

    #[test]
    fn test_scan_range_read_failure_is_error() {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        device.fail_reads_of(6);

        let mut session = session(&mut device);
        assert!(scan_range(&mut session, 0, 16).is_err());

        // Pages without a PAT before the failure were skipped silently
        let reads = device
            .transactions()
            .iter()
            .filter(|t| t.0 == Opcode::FlashRead)
            .count();
        assert_eq!(reads, 7);
    }

    #[test]
    fn test_build_and_write_then_read() -> anyhow::Result<()> {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        let mut session = session(&mut device);

        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        build_and_write(&mut session, DEFAULT_BOOTFILE_ID, 3, 40, &data)?;

        // The whole simulated flash is smaller than the search range
        let found = scan(&mut session)?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pages, [40, 41, 42, 43]);
        assert_eq!(found[0].size, 1000);

        let (bootfile, image) = read_bootfile(&mut session, 3)?;
        assert_eq!(bootfile, found[0]);
        assert_eq!(image.len(), 4 * PAGE_SIZE);
        assert_eq!(&image[..1000], &data[..]);
        Ok(())
    }

    #[test]
    fn test_build_and_write_data_before_pat() -> anyhow::Result<()> {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        let mut session = session(&mut device);

        build_and_write(&mut session, 5, 3, 40, &[0x42; 300])?;

        let writes: Vec<u32> = device
            .transactions()
            .iter()
            .filter(|t| t.0 == Opcode::FlashWrite)
            .map(|t| t.1)
            .collect();
        // Block 2 (data) is rewritten before block 0 (PAT)
        assert_eq!(writes.first(), Some(&32));
        assert_eq!(writes.last(), Some(&15));
        Ok(())
    }

    #[test]
    fn test_build_and_write_rejects_without_flash_commands() {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        let mut session = session(&mut device);

        let too_big = vec![0u8; (pat_capacity(PAGE_SIZE) + 1) * PAGE_SIZE];
        assert!(matches!(
            build_and_write(&mut session, 1, 3, 40, &too_big),
            Err(IspError::Capacity { .. })
        ));

        assert!(matches!(
            build_and_write(&mut session, 1, 45, 40, &[1; 300]),
            Err(IspError::Overlap { pat_page: 45, block: 2 })
        ));

        // Only the geometry read from opening the session
        assert_eq!(device.transactions(), [(Opcode::FlashConfigRead, 0)]);
    }

    #[test]
    fn test_build_page_near_last_page_number() {
        assert!(matches!(
            build_page(PAGE_SIZE, 1, u32::MAX - 1, 1000),
            Err(IspError::Geometry(GeometryError::PageOverflow {
                first: 0xFFFF_FFFE,
                count: 4
            }))
        ));

        // The last page number itself is still usable
        let page = build_page(PAGE_SIZE, 1, u32::MAX - 3, 1000).unwrap();
        assert_eq!(parse(0, &page).unwrap().last_page(), Some(u32::MAX - 1));
    }

    #[test]
    fn test_build_and_write_checks_both_ranges_first() {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        let mut session = session(&mut device);
        let total_pages = TEST_GEOMETRY.total_pages() as u32;

        // PAT page beyond the flash: the data must not be written either
        assert!(matches!(
            build_and_write(&mut session, 1, total_pages + 5, 40, &[1; 300]),
            Err(IspError::Geometry(GeometryError::OutOfRange { .. }))
        ));

        // Data running off the end of the flash
        assert!(matches!(
            build_and_write(&mut session, 1, 3, total_pages - 1, &[1; 300]),
            Err(IspError::Geometry(GeometryError::OutOfRange { .. }))
        ));

        assert!(matches!(
            build_and_write(&mut session, 1, 3, u32::MAX - 1, &[1; 300]),
            Err(IspError::Geometry(GeometryError::PageOverflow { .. }))
        ));

        assert_eq!(device.transactions(), [(Opcode::FlashConfigRead, 0)]);
    }

    #[test]
    fn test_read_bootfile_not_pat() {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        let mut session = session(&mut device);
        assert!(matches!(
            read_bootfile(&mut session, 3),
            Err(IspError::Format { page: 3 })
        ));
    }
}
