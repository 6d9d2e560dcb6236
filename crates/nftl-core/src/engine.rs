//! The FTL engine: translation table, log buffers, write/read unit
//! resolution, and reclamation.
//!
//! One [`Ftl`] owns its MTD device exclusively and runs every operation to
//! completion on the calling thread. There is no background reclamation and
//! no internal locking; crash consistency comes from the on-flash write
//! ordering (see `mount.rs`), not from runtime synchronization.

use crate::alloc::FreeMap;
use crate::meta;
use crate::mount::MountReport;
use crate::ondisk::BciPatch;
use nftl_error::{FtlError, Result};
use nftl_mtd::Mtd;
use nftl_types::{Geometry, Lbn, LogicalBlockSize, Pbn, SectorSlot, Vbn};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// FTL construction parameters.
///
/// `logic_blk_size` must divide the MTD erase-unit size; `nb_log_blocks`
/// must be at least 2 so reclamation can always make forward progress;
/// `reserved_blocks` are erase units at the top of the chip the FTL never
/// touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtlConfig {
    pub logic_blk_size: u32,
    pub nb_log_blocks: u16,
    pub reserved_blocks: u16,
}

impl FtlConfig {
    fn geometry(&self, chip_size: u32, erase_unit: u32) -> Result<Geometry> {
        let logic = LogicalBlockSize::new(self.logic_blk_size)
            .map_err(|err| FtlError::Config(err.to_string()))?;
        Geometry::compute(
            chip_size,
            erase_unit,
            logic,
            self.nb_log_blocks,
            self.reserved_blocks,
        )
        .map_err(|err| FtlError::Config(err.to_string()))
    }
}

/// Wear counters harvested from every trusted BCI on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WearSummary {
    pub min: u32,
    pub max: u32,
    pub total: u64,
    /// Blocks whose BCI carried a valid magic.
    pub blocks: u16,
}

/// In-RAM descriptor of one log buffer block.
///
/// `map[i]` records which logical sector physical slot `i` holds; `None`
/// marks a consumed slot whose commit never completed. `used` counts
/// consumed slots, valid or not — a torn append must not be reprogrammed.
#[derive(Debug, Clone)]
pub(crate) struct LogBuf {
    pub pbn: Pbn,
    pub vbn: Vbn,
    pub used: u16,
    pub map: Vec<Option<u8>>,
}

impl LogBuf {
    pub(crate) fn fresh(pbn: Pbn, vbn: Vbn, sectors_per_blk: u16) -> Self {
        Self {
            pbn,
            vbn,
            used: 0,
            map: vec![None; usize::from(sectors_per_blk)],
        }
    }

    pub(crate) fn is_full(&self, sectors_per_blk: u16) -> bool {
        self.used >= sectors_per_blk
    }

    /// Full and in order: slot `i` holds logical sector `i` for every slot.
    /// Such a buffer is already a complete data block.
    pub(crate) fn is_identity(&self, sectors_per_blk: u16) -> bool {
        self.is_full(sectors_per_blk)
            && self
                .map
                .iter()
                .enumerate()
                .all(|(i, entry)| *entry == Some(u8::try_from(i).unwrap_or(u8::MAX)))
    }

    /// Newest committed entry for logical sector `sec`, if any. Appends are
    /// ordered, so the scan runs backward from the last consumed slot.
    pub(crate) fn find_newest(&self, sec: u8) -> Option<SectorSlot> {
        (0..usize::from(self.used))
            .rev()
            .find(|&slot| self.map[slot] == Some(sec))
            .map(|slot| SectorSlot(u8::try_from(slot).unwrap_or(u8::MAX)))
    }

    pub(crate) fn valid_entries(&self) -> usize {
        self.map.iter().flatten().count()
    }
}

enum WriteUnit {
    Direct { pbn: Pbn, slot: SectorSlot },
    Log { pbn: Pbn, slot: SectorSlot },
}

/// The flash translation layer service.
///
/// Geometry, the logical→physical table, the free bitmap, and the log
/// descriptors are all derived state, rebuilt from on-flash metadata at
/// every mount. The engine owns all of it in `Vec`s sized once at
/// construction; nothing grows afterwards.
pub struct Ftl<M: Mtd> {
    pub(crate) mtd: M,
    pub(crate) geo: Geometry,
    /// vbn → direct physical block.
    pub(crate) table: Vec<Option<Pbn>>,
    pub(crate) free: FreeMap,
    /// Occupied log descriptors, at most `nb_log_blocks`.
    pub(crate) logs: Vec<LogBuf>,
    /// One logical block of scratch for merge copies.
    pub(crate) scratch: Vec<u8>,
    pub(crate) report: MountReport,
}

impl<M: Mtd> Ftl<M> {
    /// Initialize: derive geometry, then mount. If the first mount fails,
    /// the device is formatted and mounted once more; a second failure is
    /// fatal.
    pub fn new(mtd: M, config: FtlConfig) -> Result<Self> {
        let geo = config.geometry(mtd.chip_size(), mtd.erase_unit_size())?;
        let scratch = vec![0u8; geo.logic_blk_size as usize];
        let mut ftl = Self {
            mtd,
            geo,
            table: vec![None; usize::from(geo.data_vbns())],
            free: FreeMap::new_all_free(geo.nb_blocks),
            logs: Vec::with_capacity(usize::from(geo.nb_log_blocks)),
            scratch,
            report: MountReport::default(),
        };
        match ftl.mount() {
            Ok(report) => ftl.report = report,
            Err(err) => {
                warn!(%err, "mount failed, formatting device and retrying");
                ftl.format()
                    .map_err(|e| FtlError::MountFailed(e.to_string()))?;
                ftl.report = ftl
                    .mount()
                    .map_err(|e| FtlError::MountFailed(e.to_string()))?;
            }
        }
        Ok(ftl)
    }

    /// Number of addressable logical blocks (`max_lbn + 1`).
    #[must_use]
    pub fn logical_block_count(&self) -> u32 {
        self.geo.max_lbn + 1
    }

    /// Size of one logical block in bytes.
    #[must_use]
    pub fn logic_blk_size(&self) -> u32 {
        self.geo.logic_blk_size
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// What the last mount found and repaired.
    #[must_use]
    pub fn mount_report(&self) -> &MountReport {
        &self.report
    }

    /// Consume the handle, returning the device (simulates a power-down in
    /// tests; a subsequent [`Ftl::new`] is the power-up).
    pub fn into_mtd(self) -> M {
        self.mtd
    }

    /// Read one logical block into `buf`.
    ///
    /// A block that has never been written reads as zeroes; that is the
    /// documented contract, not an error.
    pub fn read(&mut self, lbn: Lbn, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(lbn)?;
        self.check_len(buf.len())?;
        let vbn = self.geo.vbn_of(lbn);
        let sec = self.geo.slot_of(lbn);

        // Log entries shadow the direct block: newest append wins.
        if let Some(lb) = self.logs.iter().find(|l| l.vbn == vbn) {
            if let Some(slot) = lb.find_newest(sec.0) {
                return meta::read_sector(&self.mtd, &self.geo, lb.pbn, slot, buf);
            }
        }
        if let Some(direct) = self.table[usize::from(vbn.0)] {
            let sci = meta::read_sci(&self.mtd, &self.geo, direct, sec)?;
            if sci.committed() {
                return meta::read_sector(&self.mtd, &self.geo, direct, sec, buf);
            }
        }
        buf.fill(0);
        Ok(())
    }

    /// Write one logical block.
    ///
    /// May trigger log-buffer reclamation; fails with [`FtlError::DeviceFull`]
    /// if no free physical block can be found at any allocation point.
    pub fn write(&mut self, lbn: Lbn, data: &[u8]) -> Result<()> {
        self.check_bounds(lbn)?;
        self.check_len(data.len())?;
        let vbn = self.geo.vbn_of(lbn);
        let sec = self.geo.slot_of(lbn);

        match self.find_write_unit(vbn, sec)? {
            WriteUnit::Direct { pbn, slot } => self.commit_sector(pbn, slot, sec.0, data),
            WriteUnit::Log { pbn, slot } => {
                let res = self.commit_sector(pbn, slot, sec.0, data);
                // The slot is consumed either way; a torn append must never
                // be reprogrammed, and an uncommitted entry stays invisible.
                if let Some(lb) = self.logs.iter_mut().find(|l| l.vbn == vbn) {
                    lb.used += 1;
                    lb.map[usize::from(slot.0)] = res.as_ref().ok().map(|()| sec.0);
                }
                res
            }
        }
    }

    /// Erase counters across the whole managed pool.
    pub fn wear_summary(&self) -> Result<WearSummary> {
        let mut summary = WearSummary {
            min: u32::MAX,
            ..WearSummary::default()
        };
        for i in 0..self.geo.nb_blocks {
            let bci = meta::read_bci(&self.mtd, &self.geo, Pbn(i))?;
            if bci.magic_valid() {
                summary.min = summary.min.min(bci.wear);
                summary.max = summary.max.max(bci.wear);
                summary.total += u64::from(bci.wear);
                summary.blocks += 1;
            }
        }
        if summary.blocks == 0 {
            summary.min = 0;
        }
        Ok(summary)
    }

    /// Full-device format: erase every managed block and reset all derived
    /// state. Wear counters survive (they are re-read before each erase).
    pub fn format(&mut self) -> Result<()> {
        info!(blocks = self.geo.nb_blocks, "formatting device");
        for i in 0..self.geo.nb_blocks {
            meta::erase_refresh(&mut self.mtd, &self.geo, Pbn(i))?;
        }
        self.reset_state();
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    pub(crate) fn reset_state(&mut self) {
        self.table.fill(None);
        self.logs.clear();
        self.free = FreeMap::new_all_free(self.geo.nb_blocks);
    }

    fn check_bounds(&self, lbn: Lbn) -> Result<()> {
        if lbn.0 > self.geo.max_lbn {
            return Err(FtlError::OutOfRange {
                lbn: lbn.0,
                max: self.geo.max_lbn,
            });
        }
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.geo.logic_blk_size as usize {
            return Err(FtlError::Config(format!(
                "buffer length {len} does not match logic_blk_size {}",
                self.geo.logic_blk_size
            )));
        }
        Ok(())
    }

    /// Two-phase sector commit: claim the slot, program the payload, then
    /// mark it complete. Readers trust the payload only after phase 2.
    fn commit_sector(&mut self, pbn: Pbn, slot: SectorSlot, sec: u8, data: &[u8]) -> Result<()> {
        meta::sci_begin(&mut self.mtd, &self.geo, pbn, slot, sec)?;
        meta::program_sector(&mut self.mtd, &self.geo, pbn, slot, data)?;
        meta::sci_commit(&mut self.mtd, &self.geo, pbn, slot, sec)
    }

    fn alloc_block(&mut self) -> Result<Pbn> {
        self.free.take_next_free().ok_or(FtlError::DeviceFull)
    }

    /// Locate (or create) the physical sector the next write to
    /// (`vbn`, `sec`) must target.
    fn find_write_unit(&mut self, vbn: Vbn, sec: SectorSlot) -> Result<WriteUnit> {
        let ti = usize::from(vbn.0);

        let Some(direct) = self.table[ti] else {
            // First write into this virtual block: start a direct block.
            let pbn = self.alloc_block()?;
            meta::write_bci_patch(
                &mut self.mtd,
                &self.geo,
                pbn,
                &BciPatch::blank().type_data().lbn1(vbn).lbn2(vbn),
            )?;
            self.table[ti] = Some(pbn);
            debug!(pbn = pbn.0, vbn = vbn.0, "new direct block");
            return Ok(WriteUnit::Direct { pbn, slot: sec });
        };

        let sci = meta::read_sci(&self.mtd, &self.geo, direct, sec)?;
        if sci.is_blank() {
            // Sector never touched: in-place first write is allowed.
            return Ok(WriteUnit::Direct { pbn: direct, slot: sec });
        }

        // Overwrite: the sector must go through a log buffer.
        if let Some(idx) = self.logs.iter().position(|l| l.vbn == vbn) {
            if !self.logs[idx].is_full(self.geo.sectors_per_blk) {
                let lb = &self.logs[idx];
                let slot = SectorSlot(u8::try_from(lb.used).unwrap_or(u8::MAX));
                return Ok(WriteUnit::Log { pbn: lb.pbn, slot });
            }
            // The bound buffer is full: merge it before opening a new one.
            self.reclaim(idx)?;
        } else if self.logs.len() == usize::from(self.geo.nb_log_blocks) {
            // All descriptors taken by other virtual blocks: evict the most
            // pressured one.
            let victim = self
                .logs
                .iter()
                .enumerate()
                .max_by_key(|(_, l)| l.used)
                .map(|(i, _)| i)
                .ok_or(FtlError::DeviceFull)?;
            self.reclaim(victim)?;
        }

        let pbn = self.alloc_block()?;
        meta::write_bci_patch(
            &mut self.mtd,
            &self.geo,
            pbn,
            &BciPatch::blank().type_log().lbn1(vbn).lbn2(vbn),
        )?;
        debug!(pbn = pbn.0, vbn = vbn.0, "new log block");
        self.logs
            .push(LogBuf::fresh(pbn, vbn, self.geo.sectors_per_blk));
        Ok(WriteUnit::Log {
            pbn,
            slot: SectorSlot(0),
        })
    }

    /// Reclaim log descriptor `idx`: Switch when the buffer is a complete
    /// in-order block, full merge otherwise.
    fn reclaim(&mut self, idx: usize) -> Result<()> {
        if self.logs[idx].is_identity(self.geo.sectors_per_blk) {
            self.promote_full_log(idx)
        } else {
            self.merge(idx)
        }
    }

    /// Switch: a full, in-order log block *is* the new data block. Erase the
    /// direct block it supersedes and re-tag in place — no copying.
    pub(crate) fn promote_full_log(&mut self, idx: usize) -> Result<()> {
        let lb = self.logs[idx].clone();
        debug!(pbn = lb.pbn.0, vbn = lb.vbn.0, "switch-promoting log block");
        let ti = usize::from(lb.vbn.0);
        if let Some(old) = self.table[ti] {
            self.erase_free(old)?;
        }
        meta::write_bci_patch(&mut self.mtd, &self.geo, lb.pbn, &BciPatch::blank().type_data())?;
        self.install(lb.vbn, lb.pbn, idx);
        Ok(())
    }

    /// Normal merge: fold the log buffer and its direct block into a fresh
    /// block.
    ///
    /// Durability ordering: sector copies first, then the `type_copy` tag
    /// with `lbn1`, then `lbn2` (the copy block is trusted only once the
    /// dual fields agree), then the superseded blocks are erased, and only
    /// then is the block promoted to `type_data`. A crash anywhere in
    /// between is resolved by the mount scanner: an inconsistent copy block
    /// is discarded, a consistent one is finalized.
    fn merge(&mut self, idx: usize) -> Result<()> {
        let lb = self.logs[idx].clone();
        let dst = self.alloc_block()?;
        debug!(
            src = lb.pbn.0,
            dst = dst.0,
            vbn = lb.vbn.0,
            used = lb.used,
            "merging log block"
        );

        let direct = self.table[usize::from(lb.vbn.0)];
        let mut scratch = std::mem::take(&mut self.scratch);
        let res = self.merge_sectors(&lb, direct, dst, &mut scratch);
        self.scratch = scratch;
        res?;

        meta::write_bci_patch(
            &mut self.mtd,
            &self.geo,
            dst,
            &BciPatch::blank().type_copy().lbn1(lb.vbn),
        )?;
        meta::write_bci_patch(&mut self.mtd, &self.geo, dst, &BciPatch::blank().lbn2(lb.vbn))?;

        if let Some(old) = direct {
            self.erase_free(old)?;
        }
        self.erase_free(lb.pbn)?;

        meta::write_bci_patch(&mut self.mtd, &self.geo, dst, &BciPatch::blank().type_data())?;
        self.install(lb.vbn, dst, idx);
        Ok(())
    }

    /// Copy the freshest version of every sector into `dst`. The log buffer
    /// shadows the direct block; the direct block only backfills sectors the
    /// log never saw. Sectors neither source has stay unprogrammed and read
    /// as zeroes later.
    fn merge_sectors(
        &mut self,
        lb: &LogBuf,
        direct: Option<Pbn>,
        dst: Pbn,
        scratch: &mut [u8],
    ) -> Result<()> {
        for sec in 0..u8::try_from(self.geo.sectors_per_blk).unwrap_or(u8::MAX) {
            let src = if let Some(slot) = lb.find_newest(sec) {
                Some((lb.pbn, slot))
            } else if let Some(d) = direct {
                let sci = meta::read_sci(&self.mtd, &self.geo, d, SectorSlot(sec))?;
                sci.committed().then_some((d, SectorSlot(sec)))
            } else {
                None
            };
            if let Some((src_pbn, src_slot)) = src {
                meta::read_sector(&self.mtd, &self.geo, src_pbn, src_slot, scratch)?;
                meta::sci_begin(&mut self.mtd, &self.geo, dst, SectorSlot(sec), sec)?;
                meta::program_sector(&mut self.mtd, &self.geo, dst, SectorSlot(sec), scratch)?;
                meta::sci_commit(&mut self.mtd, &self.geo, dst, SectorSlot(sec), sec)?;
            }
        }
        Ok(())
    }

    /// Shared tail of both reclamation paths: point the table at the new
    /// block and drop the descriptor.
    fn install(&mut self, vbn: Vbn, pbn: Pbn, idx: usize) {
        self.table[usize::from(vbn.0)] = Some(pbn);
        self.logs.remove(idx);
    }

    /// Erase a block, refresh its wear-carrying header, and return it to the
    /// free pool.
    pub(crate) fn erase_free(&mut self, pbn: Pbn) -> Result<u32> {
        let wear = meta::erase_refresh(&mut self.mtd, &self.geo, pbn)?;
        self.free.set_free(pbn, true);
        Ok(wear)
    }
}
