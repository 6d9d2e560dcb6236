//! Metadata and sector I/O against the MTD device.
//!
//! Thin, address-computing wrappers over [`Mtd`] so the engine and the
//! mount scanner never do raw offset arithmetic themselves. All writes here
//! are NOR patches: images carry `0xFF` in every byte they do not mean to
//! touch.

use crate::ondisk::{Bci, BciPatch, Sci, BCI_BYTES, SCI_BYTES};
use nftl_error::Result;
use nftl_mtd::Mtd;
use nftl_types::{Geometry, Pbn, SectorSlot};

pub(crate) fn read_bci<M: Mtd>(mtd: &M, geo: &Geometry, pbn: Pbn) -> Result<Bci> {
    let mut raw = [0u8; BCI_BYTES];
    mtd.read(geo.block_addr(pbn), &mut raw)?;
    Ok(Bci::decode(&raw))
}

pub(crate) fn write_bci_patch<M: Mtd>(
    mtd: &mut M,
    geo: &Geometry,
    pbn: Pbn,
    patch: &BciPatch,
) -> Result<()> {
    mtd.program(geo.block_addr(pbn), patch.bytes())
}

pub(crate) fn read_sci<M: Mtd>(mtd: &M, geo: &Geometry, pbn: Pbn, slot: SectorSlot) -> Result<Sci> {
    let mut raw = [0u8; SCI_BYTES];
    mtd.read(geo.sci_addr(pbn, slot), &mut raw)?;
    Ok(Sci::decode(&raw))
}

/// Phase 1 of the sector commit: claim the slot before writing payload.
pub(crate) fn sci_begin<M: Mtd>(
    mtd: &mut M,
    geo: &Geometry,
    pbn: Pbn,
    slot: SectorSlot,
    sec: u8,
) -> Result<()> {
    mtd.program(geo.sci_addr(pbn, slot), &Sci::begin_image(sec))
}

/// Phase 2: mark the payload complete. Only after this does a read trust it.
pub(crate) fn sci_commit<M: Mtd>(
    mtd: &mut M,
    geo: &Geometry,
    pbn: Pbn,
    slot: SectorSlot,
    sec: u8,
) -> Result<()> {
    mtd.program(geo.sci_addr(pbn, slot), &Sci::commit_image(sec))
}

pub(crate) fn read_sector<M: Mtd>(
    mtd: &M,
    geo: &Geometry,
    pbn: Pbn,
    slot: SectorSlot,
    buf: &mut [u8],
) -> Result<()> {
    debug_assert_eq!(buf.len(), geo.logic_blk_size as usize);
    mtd.read(geo.sector_addr(pbn, slot), buf)
}

pub(crate) fn program_sector<M: Mtd>(
    mtd: &mut M,
    geo: &Geometry,
    pbn: Pbn,
    slot: SectorSlot,
    data: &[u8],
) -> Result<()> {
    debug_assert_eq!(data.len(), geo.logic_blk_size as usize);
    mtd.program(geo.sector_addr(pbn, slot), data)
}

/// Erase a block and immediately rewrite a bare BCI (magic + bumped wear),
/// so the erase counter survives the erase itself. Returns the new wear.
pub(crate) fn erase_refresh<M: Mtd>(mtd: &mut M, geo: &Geometry, pbn: Pbn) -> Result<u32> {
    let old = read_bci(mtd, geo, pbn)?;
    let wear = if old.magic_valid() {
        old.wear.wrapping_add(1)
    } else {
        1
    };
    mtd.erase(geo.block_addr(pbn), geo.erase_unit)?;
    write_bci_patch(mtd, geo, pbn, &BciPatch::fresh(wear))?;
    Ok(wear)
}

/// Reconstruct a log block's slot occupancy from its SCI array.
///
/// Log blocks are append-only, so the first blank SCI ends the used region.
/// `map[i]` is the logical sector held by physical slot `i`, or `None` for
/// a consumed-but-uncommitted (torn) slot.
pub(crate) fn scan_log_slots<M: Mtd>(
    mtd: &M,
    geo: &Geometry,
    pbn: Pbn,
) -> Result<(u16, Vec<Option<u8>>)> {
    let mut map = vec![None; usize::from(geo.sectors_per_blk)];
    let mut used = 0u16;
    for slot in 0..geo.sectors_per_blk {
        // slot < sectors_per_blk <= 0xFE.
        #[expect(clippy::cast_possible_truncation)]
        let sci = read_sci(mtd, geo, pbn, SectorSlot(slot as u8))?;
        if sci.is_blank() {
            break;
        }
        if sci.committed() && u16::from(sci.sec0) < geo.sectors_per_blk {
            map[usize::from(slot)] = Some(sci.sec0);
        }
        used = slot + 1;
    }
    Ok((used, map))
}
