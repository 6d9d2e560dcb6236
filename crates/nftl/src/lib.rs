//! Umbrella crate: one import for the whole translation layer.
//!
//! Re-exports the engine ([`Ftl`]), device traits and test doubles from
//! `nftl-mtd`, the shared id and geometry types, and the error taxonomy.
//! Depend on this crate unless you only need one layer.

#![forbid(unsafe_code)]

pub use nftl_core::{nvram, Ftl, FtlConfig, MountReport, WearSummary};
pub use nftl_error::{FtlError, Result};
pub use nftl_mtd::{FileMtd, MemMtd, Mtd, ERASED_BYTE};
pub use nftl_types::{Geometry, GeometryError, Lbn, LogicalBlockSize, Pbn, SectorSlot, Vbn};
