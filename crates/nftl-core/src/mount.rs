//! Mount-time scan and crash recovery.
//!
//! The translation table, free bitmap, and log descriptors are never
//! persisted; they are rebuilt here from on-flash BCI/SCI metadata on every
//! mount. Every block the scanner cannot fully trust is erased and returned
//! to the free pool — corruption is resolved locally, scoped to that block,
//! and never surfaced as an error.
//!
//! Classification, per block in ascending pbn order:
//!
//! 1. bad magic → garbage (unformatted or torn header): erase.
//! 2. torn log tag, or `lbn1 != lbn2` → an interrupted dual-field write:
//!    erase; the in-flight operation is discarded.
//! 3. `type_data` → direct data block. The first block claiming a virtual
//!    block wins; a later duplicate is erased.
//! 4. `type_log` → log buffer; slot map rebuilt from committed SCIs. A log
//!    with no valid entry, or one past the descriptor budget, is vestigial
//!    or corrupt: erased.
//! 5. `type_copy` → a compaction that crashed between its durability
//!    checkpoint and promotion; finalized after the scan.
//! 6. untagged → free, provided its SCI region is untouched (a half-written
//!    merge target is not free: erase it).
//!
//! After the scan: at most one copy block is finalized (erase whatever it
//! supersedes, promote it to data), and every full, in-order log buffer is
//! switch-promoted to a data block — the O(1) reclamation shortcut.

use crate::engine::{Ftl, LogBuf};
use crate::meta;
use crate::ondisk::{Bci, BciPatch};
use nftl_error::Result;
use nftl_mtd::Mtd;
use nftl_types::Pbn;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What a mount found and repaired. Informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountReport {
    /// Direct data blocks installed in the translation table.
    pub data_blocks: u16,
    /// Log buffers still open after the post-scan pass.
    pub log_blocks: u16,
    /// Blocks erased because they could not be trusted.
    pub reclaimed: u16,
    /// Full in-order log buffers promoted without copying.
    pub switched: u16,
    /// Whether an interrupted compaction was completed.
    pub copy_finalized: bool,
}

/// Tracks the least-worn free block seen so far; ties keep the first
/// (lowest pbn).
#[derive(Default)]
struct LeastWorn(Option<(u32, Pbn)>);

impl LeastWorn {
    fn offer(&mut self, wear: u32, pbn: Pbn) {
        if self.0.is_none_or(|(best, _)| wear < best) {
            self.0 = Some((wear, pbn));
        }
    }
}

/// Header-level verdict on one scanned block. Tag precedence matters:
/// a switch-promoted block carries both the log and data tags and must
/// read as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockClass {
    /// No valid magic: unformatted or torn by an interrupted erase.
    Garbage,
    /// Valid magic but torn tag or disagreeing dual lbn fields.
    Torn,
    Data,
    Log,
    Copy,
    /// Magic only; free unless its sector headers say otherwise.
    Untagged,
}

fn classify(bci: &Bci) -> BlockClass {
    if !bci.magic_valid() {
        BlockClass::Garbage
    } else if bci.log_tag_corrupt() || !bci.lbn_consistent() {
        BlockClass::Torn
    } else if bci.is_data() {
        BlockClass::Data
    } else if bci.is_log() {
        BlockClass::Log
    } else if bci.is_copy() {
        BlockClass::Copy
    } else {
        BlockClass::Untagged
    }
}

impl<M: Mtd> Ftl<M> {
    /// Scan the whole managed pool and rebuild all derived state.
    ///
    /// Returns `Err` only on MTD I/O failure; every metadata-level problem
    /// is repaired in place by erasing the offending block.
    pub(crate) fn mount(&mut self) -> Result<MountReport> {
        self.reset_state();
        let mut report = MountReport::default();
        let mut copy_found: Option<Pbn> = None;
        let mut least_worn = LeastWorn::default();

        for i in 0..self.geo.nb_blocks {
            let pbn = Pbn(i);
            let bci = meta::read_bci(&self.mtd, &self.geo, pbn)?;

            match classify(&bci) {
                BlockClass::Garbage | BlockClass::Torn => {
                    debug!(pbn = i, class = ?classify(&bci), "untrusted header, erasing");
                    self.erase_free(pbn)?;
                    report.reclaimed += 1;
                    // Wear unknown before the erase: treated as the most
                    // attractive free block.
                    least_worn.offer(0, pbn);
                }
                BlockClass::Data => {
                    self.scan_data_block(pbn, &bci, &mut report, &mut least_worn)?;
                }
                BlockClass::Log => {
                    self.scan_log_block(pbn, &bci, &mut report, &mut least_worn)?;
                }
                BlockClass::Copy => {
                    let vbn_ok = usize::from(bci.lbn1) < self.table.len();
                    if !vbn_ok || copy_found.is_some() {
                        // Out-of-range target, or a second copy block: only
                        // one compaction can ever be in flight.
                        debug!(pbn = i, "unusable copy block, erasing");
                        self.erase_free(pbn)?;
                        report.reclaimed += 1;
                        least_worn.offer(0, pbn);
                    } else {
                        copy_found = Some(pbn);
                        self.free.set_free(pbn, false);
                    }
                }
                BlockClass::Untagged => {
                    // Genuinely free only if nothing ever touched its sector
                    // headers; otherwise it is a merge target that never
                    // reached its checkpoint.
                    let (used, _) = meta::scan_log_slots(&self.mtd, &self.geo, pbn)?;
                    if used > 0 {
                        debug!(pbn = i, "abandoned merge target, erasing");
                        self.erase_free(pbn)?;
                        report.reclaimed += 1;
                        least_worn.offer(0, pbn);
                    } else {
                        least_worn.offer(bci.wear, pbn);
                    }
                }
            }
        }

        if let Some(pbn) = copy_found {
            self.finalize_copy_block(pbn, &mut report)?;
        }

        // Switch pass: a reconstructed log buffer that is full and in order
        // is already a complete data block; promote it without copying.
        let mut idx = 0;
        while idx < self.logs.len() {
            if self.logs[idx].is_identity(self.geo.sectors_per_blk) {
                let superseded = self.table[usize::from(self.logs[idx].vbn.0)].is_some();
                self.promote_full_log(idx)?;
                report.switched += 1;
                report.log_blocks -= 1;
                if superseded {
                    // The old direct block was erased; block counts balance.
                    report.reclaimed += 1;
                } else {
                    report.data_blocks += 1;
                }
            } else {
                idx += 1;
            }
        }

        if let Some((wear, pbn)) = least_worn.0 {
            debug!(pbn = pbn.0, wear, "allocation cursor parked on least-worn free block");
            self.free.set_cursor(pbn);
        }

        info!(
            data_blocks = report.data_blocks,
            log_blocks = report.log_blocks,
            reclaimed = report.reclaimed,
            switched = report.switched,
            copy_finalized = report.copy_finalized,
            "mount complete"
        );
        Ok(report)
    }

    fn scan_data_block(
        &mut self,
        pbn: Pbn,
        bci: &Bci,
        report: &mut MountReport,
        least_worn: &mut LeastWorn,
    ) -> Result<()> {
        let ti = usize::from(bci.lbn1);
        if ti >= self.table.len() {
            debug!(pbn = pbn.0, vbn = bci.lbn1, "data block out of range, erasing");
            self.erase_free(pbn)?;
            report.reclaimed += 1;
            least_worn.offer(0, pbn);
            return Ok(());
        }
        if self.table[ti].is_some() {
            // Two blocks claim the same virtual block; ascending scan order
            // means the first seen wins and the later one is erased.
            debug!(pbn = pbn.0, vbn = bci.lbn1, "duplicate data block, erasing");
            self.erase_free(pbn)?;
            report.reclaimed += 1;
            least_worn.offer(0, pbn);
            return Ok(());
        }
        self.table[ti] = Some(pbn);
        self.free.set_free(pbn, false);
        report.data_blocks += 1;
        Ok(())
    }

    fn scan_log_block(
        &mut self,
        pbn: Pbn,
        bci: &Bci,
        report: &mut MountReport,
        least_worn: &mut LeastWorn,
    ) -> Result<()> {
        let vbn = bci.vbn();
        let in_range = usize::from(vbn.0) < self.table.len();
        let duplicate = self.logs.iter().any(|l| l.vbn == vbn);
        let over_budget = self.logs.len() >= usize::from(self.geo.nb_log_blocks);

        let (used, map) = if in_range {
            meta::scan_log_slots(&self.mtd, &self.geo, pbn)?
        } else {
            (0, Vec::new())
        };
        let valid = map.iter().flatten().count();

        if !in_range || valid == 0 || duplicate || over_budget {
            debug!(
                pbn = pbn.0,
                vbn = vbn.0,
                in_range,
                valid,
                duplicate,
                over_budget,
                "unusable log block, erasing"
            );
            self.erase_free(pbn)?;
            report.reclaimed += 1;
            least_worn.offer(0, pbn);
            return Ok(());
        }

        self.logs.push(LogBuf {
            pbn,
            vbn,
            used,
            map,
        });
        self.free.set_free(pbn, false);
        report.log_blocks += 1;
        Ok(())
    }

    /// Complete an interrupted compaction: the copy block holds the merged
    /// image, so whatever it supersedes (old direct block, matching log
    /// buffer) is erased, then the copy block becomes the data block.
    /// Idempotent — the superseding relationships are re-derived from flash
    /// every time.
    fn finalize_copy_block(&mut self, pbn: Pbn, report: &mut MountReport) -> Result<()> {
        let bci = meta::read_bci(&self.mtd, &self.geo, pbn)?;
        let vbn = bci.vbn();
        let ti = usize::from(vbn.0);
        info!(pbn = pbn.0, vbn = vbn.0, "finalizing interrupted compaction");

        if let Some(old) = self.table[ti] {
            self.erase_free(old)?;
            report.reclaimed += 1;
            report.data_blocks -= 1;
        }
        if let Some(idx) = self.logs.iter().position(|l| l.vbn == vbn) {
            let log_pbn = self.logs[idx].pbn;
            self.erase_free(log_pbn)?;
            self.logs.remove(idx);
            report.reclaimed += 1;
            report.log_blocks -= 1;
        }

        meta::write_bci_patch(&mut self.mtd, &self.geo, pbn, &BciPatch::blank().type_data())?;
        self.table[ti] = Some(pbn);
        report.data_blocks += 1;
        report.copy_finalized = true;
        Ok(())
    }
}
