//! On-flash metadata layout: block control info (BCI) and sector control
//! info (SCI).
//!
//! Both structures live in the header region at the front of every physical
//! block and obey NOR discipline: fields start life as `0xFF` (erased) and
//! are programmed incrementally, each transition clearing bits only. A field
//! that still reads all-ones is *unset*, not zero.
//!
//! Layout (little-endian):
//!
//! ```text
//! BCI, 16 bytes at block offset 0:
//!   0..4   magic       validity marker, "NFTL"
//!   4      type_log    0x00 once the block serves as a log buffer
//!   5      type_copy   0x00 once the block is a compaction target
//!   6      type_data   0x00 once the block is a direct data block
//!   7      reserved
//!   8..10  lbn1        virtual block number, first copy
//!   10..12 lbn2        virtual block number, second copy
//!   12..16 wear        erase counter, rewritten after every erase
//!
//! SCI, 4 bytes each, array at block offset 16:
//!   0      stat_start  0xA5 programmed before the sector payload
//!   1      stat_data   0x5A programmed after the payload completes
//!   2      sec0        logical sector within the virtual block, first copy
//!   3      sec1        logical sector within the virtual block, second copy
//! ```
//!
//! Trust rules: a BCI is trusted only if `magic` matches and `lbn1 == lbn2`
//! (an interrupted dual-field write leaves them unequal). A sector's payload
//! is trusted only if both status bytes carry their committed values and
//! `sec0 == sec1` — the two-phase commit makes a torn sector write
//! detectable, never silently readable.

use nftl_types::Vbn;

/// BCI validity marker ("NFTL" when read as bytes).
pub(crate) const FTL_MAGIC: u32 = 0x4C54_464E;

/// Value of a programmed role tag.
pub(crate) const TAG_SET: u8 = 0x00;

/// Value of any unprogrammed byte.
pub(crate) const UNSET: u8 = 0xFF;

/// Unset dual lbn field.
pub(crate) const NIL_LBN: u16 = 0xFFFF;

/// `stat_start` committed value.
pub(crate) const SCI_START_TAG: u8 = 0xA5;

/// `stat_data` committed value.
pub(crate) const SCI_DATA_TAG: u8 = 0x5A;

pub(crate) const BCI_BYTES: usize = 16;
pub(crate) const SCI_BYTES: usize = 4;

/// Decoded block control info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Bci {
    pub magic: u32,
    pub type_log: u8,
    pub type_copy: u8,
    pub type_data: u8,
    pub lbn1: u16,
    pub lbn2: u16,
    pub wear: u32,
}

impl Bci {
    pub(crate) fn decode(raw: &[u8; BCI_BYTES]) -> Self {
        Self {
            magic: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            type_log: raw[4],
            type_copy: raw[5],
            type_data: raw[6],
            lbn1: u16::from_le_bytes([raw[8], raw[9]]),
            lbn2: u16::from_le_bytes([raw[10], raw[11]]),
            wear: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    pub(crate) fn magic_valid(&self) -> bool {
        self.magic == FTL_MAGIC
    }

    /// Dual-field consistency: an interrupted tag write leaves these unequal.
    pub(crate) fn lbn_consistent(&self) -> bool {
        self.lbn1 == self.lbn2
    }

    pub(crate) fn is_data(&self) -> bool {
        self.type_data == TAG_SET
    }

    pub(crate) fn is_log(&self) -> bool {
        self.type_log == TAG_SET
    }

    pub(crate) fn is_copy(&self) -> bool {
        self.type_copy == TAG_SET
    }

    /// A log tag byte that is neither programmed nor erased means the tag
    /// write itself was torn.
    pub(crate) fn log_tag_corrupt(&self) -> bool {
        self.type_log != TAG_SET && self.type_log != UNSET
    }

    pub(crate) fn vbn(&self) -> Vbn {
        Vbn(self.lbn1)
    }
}

/// Incremental BCI write: starts all-`0xFF` (a no-op program) and clears
/// only the fields the caller selects, so successive patches never disturb
/// previously programmed fields.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BciPatch([u8; BCI_BYTES]);

impl BciPatch {
    pub(crate) fn blank() -> Self {
        Self([UNSET; BCI_BYTES])
    }

    /// Full header written right after an erase: magic plus wear counter.
    pub(crate) fn fresh(wear: u32) -> Self {
        let mut patch = Self::blank();
        patch.0[0..4].copy_from_slice(&FTL_MAGIC.to_le_bytes());
        patch.0[12..16].copy_from_slice(&wear.to_le_bytes());
        patch
    }

    pub(crate) fn type_log(mut self) -> Self {
        self.0[4] = TAG_SET;
        self
    }

    pub(crate) fn type_copy(mut self) -> Self {
        self.0[5] = TAG_SET;
        self
    }

    pub(crate) fn type_data(mut self) -> Self {
        self.0[6] = TAG_SET;
        self
    }

    pub(crate) fn lbn1(mut self, vbn: Vbn) -> Self {
        self.0[8..10].copy_from_slice(&vbn.0.to_le_bytes());
        self
    }

    pub(crate) fn lbn2(mut self, vbn: Vbn) -> Self {
        self.0[10..12].copy_from_slice(&vbn.0.to_le_bytes());
        self
    }

    pub(crate) fn bytes(&self) -> &[u8; BCI_BYTES] {
        &self.0
    }
}

/// Decoded sector control info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sci {
    pub stat_start: u8,
    pub stat_data: u8,
    pub sec0: u8,
    pub sec1: u8,
}

impl Sci {
    pub(crate) fn decode(raw: &[u8; SCI_BYTES]) -> Self {
        Self {
            stat_start: raw[0],
            stat_data: raw[1],
            sec0: raw[2],
            sec1: raw[3],
        }
    }

    /// Never touched since erase.
    pub(crate) fn is_blank(&self) -> bool {
        self.stat_start == UNSET
            && self.stat_data == UNSET
            && self.sec0 == UNSET
            && self.sec1 == UNSET
    }

    /// Both commit phases completed and the duplicated sector id agrees.
    pub(crate) fn committed(&self) -> bool {
        self.stat_start == SCI_START_TAG
            && self.stat_data == SCI_DATA_TAG
            && self.sec0 == self.sec1
            && self.sec0 != UNSET
    }

    /// Phase-1 image: start tag plus duplicated sector id, data tag unset.
    pub(crate) fn begin_image(sec: u8) -> [u8; SCI_BYTES] {
        [SCI_START_TAG, UNSET, sec, sec]
    }

    /// Phase-2 image: the data tag. Other bytes re-program identically.
    pub(crate) fn commit_image(sec: u8) -> [u8; SCI_BYTES] {
        [SCI_START_TAG, SCI_DATA_TAG, sec, sec]
    }
}
