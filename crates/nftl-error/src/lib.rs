#![forbid(unsafe_code)]
//! Error types for NorFTL.
//!
//! # Error Taxonomy
//!
//! | Variant | Detected | Recoverable? |
//! |---------|----------|--------------|
//! | `Config` | init time (bad arguments, impossible geometry) | no — fix the configuration |
//! | `OutOfRange` | every read/write (`lbn > max_lbn`) | yes — caller decides |
//! | `DeviceFull` | allocation during write or compaction | only by external intervention |
//! | `Media` | runtime metadata that cannot be trusted | no — device needs a format |
//! | `MountFailed` | second mount attempt after a full format | no |
//! | `Io` | the MTD collaborator | depends on the device |
//!
//! Media *corruption found at mount time* is deliberately absent from the
//! taxonomy: the mount scanner resolves it locally by erasing the offending
//! block, never surfacing an error (data loss is scoped to that block).
//!
//! ## Design Constraints
//!
//! - `nftl-error` MUST NOT depend on `nftl-types` (no cyclic deps). The
//!   geometry layer's `GeometryError` converts into `Config` at the
//!   `nftl-core` boundary.
//! - All string payloads are owned (`String`), matching the rest of the
//!   workspace.

use thiserror::Error;

/// Unified error type for all NorFTL operations.
#[derive(Debug, Error)]
pub enum FtlError {
    /// Invalid configuration or arguments, detected synchronously at init
    /// (or a mis-sized buffer passed to read/write).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Logical block number beyond the addressable range.
    #[error("logical block {lbn} out of range (max {max})")]
    OutOfRange { lbn: u32, max: u32 },

    /// No free physical block available for a write or a compaction target.
    ///
    /// The FTL does not self-heal this condition; it is surfaced on every
    /// affected write until storage is reclaimed externally.
    #[error("device full: no free physical block")]
    DeviceFull,

    /// On-flash metadata at a known physical block cannot be trusted outside
    /// the mount path (where corruption is silently erased instead).
    #[error("media error at physical block {pbn}: {detail}")]
    Media { pbn: u16, detail: String },

    /// Mount failed even after a full-device format and retry.
    #[error("mount failed after format retry: {0}")]
    MountFailed(String),

    /// Error from the underlying MTD device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, FtlError>;
