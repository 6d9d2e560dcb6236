//! Log-structured flash translation layer over raw NOR flash.
//!
//! The engine presents a linear array of small logical blocks on top of
//! large erase units, absorbing overwrites in log buffers and reclaiming
//! them by switch or merge. All metadata lives on flash in block and
//! sector control headers; mount rebuilds the whole RAM state from a
//! single scan and recovers from any single interrupted operation.
//!
//! Entry points:
//! - [`Ftl::new`] mounts (or formats and mounts) a device.
//! - [`Ftl::read`] / [`Ftl::write`] move whole logical blocks.
//! - [`nvram`] wraps an engine in a byte-addressable named device.

#![forbid(unsafe_code)]

mod alloc;
mod engine;
mod meta;
mod mount;
mod ondisk;
pub mod nvram;

pub use engine::{Ftl, FtlConfig, WearSummary};
pub use mount::MountReport;

pub use nftl_error::{FtlError, Result};
pub use nftl_mtd::{FileMtd, MemMtd, Mtd};
pub use nftl_types::{Geometry, Lbn, LogicalBlockSize, Pbn};
