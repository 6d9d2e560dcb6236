#![forbid(unsafe_code)]
//! Typed identifiers and geometry math for NorFTL.
//!
//! Everything here is plain data: unit-carrying newtypes that prevent
//! mixing logical and physical block numbers, a validated logical block
//! size, and the [`Geometry`] calculator that derives every layout
//! constant from the device's chip/erase-unit sizes and the caller's
//! configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// On-flash size of the per-block control header (BCI).
pub const BCI_SIZE: u32 = 16;

/// On-flash size of one per-sector control header (SCI).
pub const SCI_SIZE: u32 = 4;

/// Logical block number: the externally addressable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lbn(pub u32);

/// Physical erase-unit index within the managed pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pbn(pub u16);

/// Virtual block number: the erase-unit-sized group of logical blocks
/// (`lbn / sectors_per_blk`). One virtual block maps to at most one
/// direct physical block plus at most one log buffer at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vbn(pub u16);

/// Data-sector slot index within a physical block (header sectors excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorSlot(pub u8);

/// Geometry-time validation failure.
///
/// Converted into the public error type at the `nftl-core` boundary;
/// this crate stays independent of `nftl-error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("device too small: {0}")]
    TooSmall(String),
}

/// Validated logical block size: a power of two in `[64, 65536]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlockSize(u32);

impl LogicalBlockSize {
    /// Create a `LogicalBlockSize` if `value` is a power of two in `[64, 65536]`.
    pub fn new(value: u32) -> Result<Self, GeometryError> {
        if !value.is_power_of_two() || !(64..=65536).contains(&value) {
            return Err(GeometryError::InvalidField {
                field: "logic_blk_size",
                reason: "must be a power of two in 64..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

/// All layout constants derived from device geometry and configuration.
///
/// Derivation, in order:
/// - `nb_blocks` — erase units in the managed pool (`chip_size / erase_unit`
///   minus `reserved_blocks`; reserved units sit at the top of the chip and
///   are never touched).
/// - `raw_sectors` — logical-block-sized slots per erase unit.
/// - `sectors_hdr` — slots consumed by the BCI plus the SCI array, with one
///   slot of slack.
/// - `sectors_per_blk` — data slots per block (`raw_sectors - sectors_hdr`).
/// - `max_lbn` — one pool block is held back as the compaction spare and
///   `nb_log_blocks` are held back as log buffers; everything else is
///   addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub chip_size: u32,
    pub erase_unit: u32,
    pub logic_blk_size: u32,
    /// Erase units managed by the FTL (reserved blocks excluded).
    pub nb_blocks: u16,
    /// Data sectors per block, after header reservation.
    pub sectors_per_blk: u16,
    /// Header sectors reserved at the front of every block.
    pub sectors_hdr: u16,
    pub nb_log_blocks: u16,
    pub reserved_blocks: u16,
    /// Highest addressable logical block number.
    pub max_lbn: u32,
}

impl Geometry {
    /// Derive the full layout. Fails if the configuration cannot yield at
    /// least one addressable data block.
    pub fn compute(
        chip_size: u32,
        erase_unit: u32,
        logic_blk_size: LogicalBlockSize,
        nb_log_blocks: u16,
        reserved_blocks: u16,
    ) -> Result<Self, GeometryError> {
        let logic = logic_blk_size.get();
        if erase_unit == 0 || chip_size == 0 || chip_size % erase_unit != 0 {
            return Err(GeometryError::InvalidField {
                field: "chip_size",
                reason: "must be a non-zero multiple of the erase unit",
            });
        }
        if logic > erase_unit || erase_unit % logic != 0 {
            return Err(GeometryError::InvalidField {
                field: "logic_blk_size",
                reason: "must divide the erase-unit size",
            });
        }
        if nb_log_blocks < 2 {
            return Err(GeometryError::InvalidField {
                field: "nb_log_blocks",
                reason: "at least 2 log blocks are required for reclamation",
            });
        }

        let total_blocks = chip_size / erase_unit;
        let managed = total_blocks
            .checked_sub(u32::from(reserved_blocks))
            .ok_or_else(|| GeometryError::TooSmall("reserved_blocks exceeds device".to_owned()))?;
        if managed > u32::from(u16::MAX) {
            return Err(GeometryError::InvalidField {
                field: "chip_size",
                reason: "more than 65535 managed erase units",
            });
        }

        let raw_sectors = erase_unit / logic;
        // SCI slot indices are stored in single bytes with 0xFF meaning unset.
        if raw_sectors > 0xFE {
            return Err(GeometryError::InvalidField {
                field: "logic_blk_size",
                reason: "more than 254 sectors per erase unit",
            });
        }
        let hdr_bytes = raw_sectors * SCI_SIZE + BCI_SIZE;
        let sectors_hdr = hdr_bytes.div_ceil(logic) + 1;
        let sectors_per_blk = raw_sectors
            .checked_sub(sectors_hdr)
            .filter(|&s| s > 0)
            .ok_or_else(|| {
                GeometryError::TooSmall(format!(
                    "erase unit {erase_unit} leaves no data sectors for logic_blk_size {logic}"
                ))
            })?;

        // One pool block is the compaction spare; log blocks are not addressable.
        let data_vbns = managed
            .checked_sub(1 + u32::from(nb_log_blocks))
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                GeometryError::TooSmall(format!(
                    "{managed} managed blocks cannot host {nb_log_blocks} log blocks plus a spare"
                ))
            })?;
        let max_lbn = data_vbns * sectors_per_blk - 1;

        // All three fit: managed <= u16::MAX checked above, sector counts <= 0xFE.
        #[expect(clippy::cast_possible_truncation)]
        let (nb_blocks, sectors_per_blk, sectors_hdr) =
            (managed as u16, sectors_per_blk as u16, sectors_hdr as u16);

        Ok(Self {
            chip_size,
            erase_unit,
            logic_blk_size: logic,
            nb_blocks,
            sectors_per_blk,
            sectors_hdr,
            nb_log_blocks,
            reserved_blocks,
            max_lbn,
        })
    }

    /// Number of addressable virtual blocks (logical erase-unit groups).
    #[must_use]
    pub fn data_vbns(&self) -> u16 {
        self.nb_blocks - 1 - self.nb_log_blocks
    }

    /// Virtual block holding `lbn`.
    #[must_use]
    pub fn vbn_of(&self, lbn: Lbn) -> Vbn {
        // In-range lbn always yields a vbn below data_vbns (u16).
        #[expect(clippy::cast_possible_truncation)]
        let vbn = (lbn.0 / u32::from(self.sectors_per_blk)) as u16;
        Vbn(vbn)
    }

    /// Logical sector index of `lbn` within its virtual block.
    #[must_use]
    pub fn slot_of(&self, lbn: Lbn) -> SectorSlot {
        // sectors_per_blk <= 0xFE, so the remainder fits a byte.
        #[expect(clippy::cast_possible_truncation)]
        let slot = (lbn.0 % u32::from(self.sectors_per_blk)) as u8;
        SectorSlot(slot)
    }

    /// Byte address of the start of a physical block.
    #[must_use]
    pub fn block_addr(&self, pbn: Pbn) -> u32 {
        u32::from(pbn.0) * self.erase_unit
    }

    /// Byte address of the SCI header for a data-sector slot.
    #[must_use]
    pub fn sci_addr(&self, pbn: Pbn, slot: SectorSlot) -> u32 {
        self.block_addr(pbn) + BCI_SIZE + u32::from(slot.0) * SCI_SIZE
    }

    /// Byte address of a data-sector slot's payload.
    #[must_use]
    pub fn sector_addr(&self, pbn: Pbn, slot: SectorSlot) -> u32 {
        self.block_addr(pbn)
            + (u32::from(self.sectors_hdr) + u32::from(slot.0)) * self.logic_blk_size
    }

    /// RAM the engine's owned tables occupy, in bytes: free bitmap +
    /// scratch sector + translation table + per-log descriptor maps.
    /// Useful for sizing comparisons across geometries.
    #[must_use]
    pub fn ram_footprint(&self) -> usize {
        let bitmap = usize::from(self.nb_blocks).div_ceil(8);
        let scratch = self.logic_blk_size as usize;
        let table = usize::from(self.data_vbns()) * std::mem::size_of::<Option<Pbn>>();
        let maps = usize::from(self.nb_log_blocks)
            * usize::from(self.sectors_per_blk)
            * std::mem::size_of::<Option<u8>>();
        bitmap + scratch + table + maps
    }
}
