//! This module implements writing and reading arbitrary byte ranges of NAND flash.
//!
//! Flash can only be erased a block at a time and programmed a page at a time, so writing an
//! unaligned range means reading back every block it touches, erasing them, and programming the
//! merged content again.

use log::{debug, error, warn};
use retry::{delay::NoDelay, retry, OperationResult};

use crate::device::Session;
use crate::error::Result;
use crate::nand::FlashOffsets;
use crate::transport::Channel;
use crate::IspError;

/// Program `data` starting at `first_page`, reading every page back into `scratch` and comparing.
///
/// `data` must be a whole number of pages; `scratch` must hold at least one.
fn program_verified<C: Channel>(
    session: &mut Session<C>,
    first_page: u32,
    data: &[u8],
    scratch: &mut [u8],
) -> Result<()> {
    let page_size = session.geometry()?.page_size;

    for (page, content) in (first_page..).zip(data.chunks_exact(page_size)) {
        session.write_flash_page(page, content)?;
        session.read_flash_page(page, scratch)?;

        if let Some(offset) = content
            .iter()
            .zip(&scratch[..page_size])
            .position(|(a, b)| a != b)
        {
            error!("Flash page error on page {page:#010x} at {offset:#06x}");
            return Err(IspError::VerifyMismatch { page, offset });
        }
    }

    Ok(())
}

/// Write `data` at byte `offset` of the flash, preserving everything else in the touched blocks.
///
/// There is no transactional guarantee: on failure, the touched blocks are left erased or
/// partially rewritten. A block that fails verification is re-erased and re-programmed up to
/// `write_retries` more times (see [SessionOptions](crate::device::SessionOptions)).
pub fn write_random<C: Channel>(session: &mut Session<C>, offset: u64, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    let geometry = session.geometry()?;
    let fo = FlashOffsets::new(&geometry, offset, data.len() as u64)?;

    debug!("offset: {offset:#010x}, len: {:#010x} | {fo:?}", data.len());

    let block_size = geometry.block_size();
    let pages = fo.block_pages(&geometry);
    let block_bytes = fo.block_count() as usize * block_size;

    // Room for every touched block, plus one page for verifying
    let mut buf = vec![0u8; block_bytes + geometry.page_size];
    let (blocks, scratch) = buf.split_at_mut(block_bytes);

    session.read_flash_pages(pages.start, pages.len() as u32, blocks)?;
    session.erase_blocks(pages.start, fo.block_count())?;

    let start = (offset - pages.start as u64 * geometry.page_size as u64) as usize;
    blocks[start..start + data.len()].copy_from_slice(data);

    let rpt = howudoin::new()
        .label("Writing blocks")
        .set_len(u64::from(fo.block_count()));

    for (first_page, content) in pages
        .clone()
        .step_by(geometry.pages_per_block as usize)
        .zip(blocks.chunks_exact(block_size))
    {
        let mut attempt = 0;
        let result = retry(NoDelay.take(session.options().write_retries), || {
            attempt += 1;
            if attempt > 1 {
                warn!("Rewriting block {} (attempt {attempt})", geometry.block_of(first_page));
                if let Err(e) = session.erase_block(first_page) {
                    return OperationResult::Err(e);
                }
            }

            match program_verified(session, first_page, content, scratch) {
                Ok(()) => OperationResult::Ok(()),
                Err(e @ IspError::VerifyMismatch { .. }) => OperationResult::Retry(e),
                Err(e) => OperationResult::Err(e),
            }
        });

        if let Err(e) = result {
            rpt.close();
            error!("Error writing flash pages back");
            return Err(e.error);
        }
        rpt.inc();
    }

    rpt.close();
    Ok(())
}

/// Read exactly `len` bytes at byte `offset` of the flash
pub fn read_range<C: Channel>(session: &mut Session<C>, offset: u64, len: usize) -> Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }

    let geometry = session.geometry()?;
    let fo = FlashOffsets::new(&geometry, offset, len as u64)?;

    let rpt = howudoin::new()
        .label("Reading pages")
        .set_len(u64::from(fo.page_count()));

    let mut buf = vec![0u8; fo.page_count() as usize * geometry.page_size];
    for (page, chunk) in (fo.first_page..=fo.last_page).zip(buf.chunks_exact_mut(geometry.page_size))
    {
        if let Err(e) = session.read_flash_page(page, chunk) {
            rpt.close();
            return Err(e);
        }
        rpt.inc();
    }
    rpt.close();

    let start = (offset - u64::from(fo.first_page) * geometry.page_size as u64) as usize;
    buf.drain(..start);
    buf.truncate(len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SessionOptions;
    use crate::error::GeometryError;
    use crate::nand::{PageUtil, TEST_GEOMETRY};
    use crate::sim::SimDevice;
    use crate::transport::Opcode;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn session(device: &mut SimDevice, write_retries: usize) -> Session<&mut SimDevice> {
        let options = SessionOptions {
            write_retries,
            ..Default::default()
        };
        Session::open(device, options).unwrap()
    }

    #[test]
    fn test_write_random_round_trips() -> anyhow::Result<()> {
        let block_size = TEST_GEOMETRY.block_size();
        let page_size = TEST_GEOMETRY.page_size;

        let cases = [
            // Within one block, unaligned
            (100, 300),
            // Exactly one aligned block
            (block_size, block_size),
            // Straddling two blocks
            (2 * block_size - 10, 20),
            // Spanning three blocks, unaligned at both ends
            (block_size + page_size / 2, 2 * block_size),
            // Single byte
            (7 * block_size + 3, 1),
        ];

        for (i, (offset, len)) in cases.into_iter().enumerate() {
            let mut device = SimDevice::new(TEST_GEOMETRY);
            let mut session = session(&mut device, 0);
            let data = pattern(len, i as u8);

            write_random(&mut session, offset as u64, &data)?;
            assert_eq!(read_range(&mut session, offset as u64, len)?, data, "case {i}");
        }
        Ok(())
    }

    #[test]
    fn test_write_random_preserves_neighbours() -> anyhow::Result<()> {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        let mut session = session(&mut device, 0);
        let size = TEST_GEOMETRY.total_size() as usize;

        let background = pattern(size, 0x5A);
        write_random(&mut session, 0, &background)?;

        let patch = vec![0x00; 1000];
        write_random(&mut session, 3000, &patch)?;

        let mut expected = background;
        expected[3000..4000].copy_from_slice(&patch);
        assert_eq!(read_range(&mut session, 0, size)?, expected);
        Ok(())
    }

    #[test]
    fn test_write_random_sequence() -> anyhow::Result<()> {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        let mut session = session(&mut device, 0);
        let block_size = TEST_GEOMETRY.block_size() as u64;

        write_random(&mut session, block_size + 5, b"abc")?;

        let ops: Vec<_> = session.channel().transactions().iter().map(|t| t.0).collect();
        let ppb = TEST_GEOMETRY.pages_per_block as usize;

        // Geometry read, read back the block, erase it, then program+verify every page
        assert_eq!(ops[0], Opcode::FlashConfigRead);
        assert!(ops[1..1 + ppb].iter().all(|&op| op == Opcode::FlashRead));
        assert_eq!(ops[1 + ppb], Opcode::FlashBlockErase);
        for pair in ops[2 + ppb..].chunks(2) {
            assert_eq!(pair, [Opcode::FlashWrite, Opcode::FlashRead]);
        }
        assert_eq!(ops.len(), 2 + ppb + 2 * ppb);
        Ok(())
    }

    #[test]
    fn test_write_random_verify_mismatch_is_fatal() {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        device.weaken_page(18, 1);
        let mut session = session(&mut device, 0);

        let data = pattern(TEST_GEOMETRY.block_size(), 1);
        let result = write_random(&mut session, TEST_GEOMETRY.block_size() as u64, &data);
        assert!(matches!(
            result,
            Err(IspError::VerifyMismatch { page: 18, offset: 0 })
        ));

        // Nothing after the bad page was programmed
        let mut page = vec![0; TEST_GEOMETRY.page_size];
        device.nand().read_page(19, &mut page).unwrap();
        assert!(page.is_erased());
    }

    #[test]
    fn test_write_random_retries_block() -> anyhow::Result<()> {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        device.weaken_page(18, 2);
        let mut session = session(&mut device, 2);

        let data = pattern(TEST_GEOMETRY.block_size(), 2);
        let offset = TEST_GEOMETRY.block_size() as u64;
        write_random(&mut session, offset, &data)?;
        assert_eq!(read_range(&mut session, offset, data.len())?, data);

        let erases = device
            .transactions()
            .iter()
            .filter(|t| t.0 == Opcode::FlashBlockErase)
            .count();
        assert_eq!(erases, 3);
        Ok(())
    }

    #[test]
    fn test_write_random_read_failure_erases_nothing() {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        device.fail_reads_of(20);
        let mut session = session(&mut device, 3);

        let result = write_random(&mut session, 17 * 256, b"data");
        assert!(result.is_err());
        assert!(device
            .transactions()
            .iter()
            .all(|t| t.0 != Opcode::FlashBlockErase));
    }

    #[test]
    fn test_write_random_out_of_range() {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        let mut session = session(&mut device, 0);

        let end = TEST_GEOMETRY.total_size();
        assert!(matches!(
            write_random(&mut session, end - 1, b"xy"),
            Err(IspError::Geometry(GeometryError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn test_huge_offset_is_rejected_before_any_flash_command() {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        let mut session = session(&mut device, 0);
        let offset = (TEST_GEOMETRY.block_size() as u64) << 32;

        assert!(matches!(
            write_random(&mut session, offset, b"data"),
            Err(IspError::Geometry(GeometryError::OutOfRange { .. }))
        ));
        assert!(matches!(
            read_range(&mut session, offset, 4),
            Err(IspError::Geometry(GeometryError::OutOfRange { .. }))
        ));
        assert!(matches!(
            write_random(&mut session, u64::MAX, b"data"),
            Err(IspError::Geometry(GeometryError::OutOfRange { .. }))
        ));

        // Only the geometry read from opening the session
        assert_eq!(session.channel().transactions().len(), 1);
    }

    #[test]
    fn test_empty_write_is_noop() -> anyhow::Result<()> {
        let mut device = SimDevice::new(TEST_GEOMETRY);
        let mut session = session(&mut device, 0);
        write_random(&mut session, 12345, &[])?;
        assert_eq!(session.channel().transactions().len(), 1);
        Ok(())
    }
}
