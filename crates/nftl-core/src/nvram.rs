//! Byte-addressable NVRAM facade over the block API, plus a process-wide
//! named device registry.
//!
//! The FTL exposes fixed-size logical blocks; firmware settings code wants
//! `get(offset, len)` / `set(offset, len)` at byte granularity. The shim
//! handles sub-block offsets by read-modify-write through a block-sized
//! bounce buffer. Registering a device moves the engine behind a mutex so
//! lookups from anywhere in the process share one serialized handle — the
//! engine itself stays single-threaded by contract.

// Offsets here are u32 by construction; usize is at least as wide on every
// supported target.
#![allow(clippy::cast_possible_truncation)]

use crate::engine::Ftl;
use nftl_error::{FtlError, Result};
use nftl_mtd::Mtd;
use nftl_types::Lbn;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::info;

/// Byte-level access the shim needs from an engine.
trait NvramOps: Send {
    fn capacity(&self) -> u32;
    fn get(&mut self, offset: u32, buf: &mut [u8]) -> Result<()>;
    fn set(&mut self, offset: u32, data: &[u8]) -> Result<()>;
}

fn check_span(offset: u32, len: usize, capacity: u32) -> Result<()> {
    let end = u64::from(offset) + len as u64;
    if end > u64::from(capacity) {
        return Err(FtlError::Config(format!(
            "nvram access out of bounds: offset={offset} len={len} capacity={capacity}"
        )));
    }
    Ok(())
}

impl<M: Mtd + Send> NvramOps for Ftl<M> {
    fn capacity(&self) -> u32 {
        self.logical_block_count() * self.logic_blk_size()
    }

    fn get(&mut self, mut offset: u32, buf: &mut [u8]) -> Result<()> {
        check_span(offset, buf.len(), self.capacity())?;
        let bs = self.logic_blk_size();
        let bsz = bs as usize;
        let mut bounce = vec![0u8; bsz];
        let mut out = buf;
        while !out.is_empty() {
            let lbn = Lbn(offset / bs);
            let start = (offset % bs) as usize;
            let n = out.len().min(bsz - start);
            self.read(lbn, &mut bounce)?;
            out[..n].copy_from_slice(&bounce[start..start + n]);
            out = &mut out[n..];
            offset += u32::try_from(n).unwrap_or(0);
        }
        Ok(())
    }

    fn set(&mut self, mut offset: u32, data: &[u8]) -> Result<()> {
        check_span(offset, data.len(), self.capacity())?;
        let bs = self.logic_blk_size();
        let bsz = bs as usize;
        let mut bounce = vec![0u8; bsz];
        let mut rest = data;
        while !rest.is_empty() {
            let lbn = Lbn(offset / bs);
            let start = (offset % bs) as usize;
            let n = rest.len().min(bsz - start);
            if start == 0 && n == bsz {
                self.write(lbn, &rest[..n])?;
            } else {
                // Partial block: read-modify-write through the bounce buffer.
                self.read(lbn, &mut bounce)?;
                bounce[start..start + n].copy_from_slice(&rest[..n]);
                self.write(lbn, &bounce)?;
            }
            rest = &rest[n..];
            offset += u32::try_from(n).unwrap_or(0);
        }
        Ok(())
    }
}

/// A registered byte-addressable NVRAM device. Cheap to clone; all clones
/// serialize on the same underlying engine.
#[derive(Clone)]
pub struct Nvram {
    name: Arc<str>,
    inner: Arc<Mutex<dyn NvramOps>>,
}

impl Nvram {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Addressable capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.inner.lock().capacity()
    }

    /// Byte-level read. Never-written regions read as zeroes, matching the
    /// block API.
    pub fn get(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.inner.lock().get(offset, buf)
    }

    /// Byte-level write, read-modify-write for partial blocks.
    pub fn set(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.inner.lock().set(offset, data)
    }
}

impl std::fmt::Debug for Nvram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nvram").field("name", &self.name).finish()
    }
}

fn registry() -> &'static RwLock<HashMap<String, Nvram>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Nvram>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register an engine as a named NVRAM device, consuming it.
///
/// Fails if the name is already taken. The returned handle (and any
/// [`lookup`] of the same name) is the only way to reach the engine from
/// then on.
pub fn register<M: Mtd + Send + 'static>(name: &str, ftl: Ftl<M>) -> Result<Nvram> {
    let mut devices = registry().write();
    if devices.contains_key(name) {
        return Err(FtlError::Config(format!(
            "nvram device {name:?} already registered"
        )));
    }
    let dev = Nvram {
        name: Arc::from(name),
        inner: Arc::new(Mutex::new(ftl)),
    };
    devices.insert(name.to_owned(), dev.clone());
    info!(name, capacity = dev.capacity(), "nvram device registered");
    Ok(dev)
}

/// Look up a previously registered device by name.
#[must_use]
pub fn lookup(name: &str) -> Option<Nvram> {
    registry().read().get(name).cloned()
}

/// Remove a device from the registry, returning its handle if present.
pub fn unregister(name: &str) -> Option<Nvram> {
    registry().write().remove(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FtlConfig;
    use nftl_mtd::MemMtd;

    const CFG: FtlConfig = FtlConfig {
        logic_blk_size: 512,
        nb_log_blocks: 2,
        reserved_blocks: 0,
    };

    fn fresh() -> Ftl<MemMtd> {
        Ftl::new(MemMtd::new(8 * 4096, 4096), CFG).expect("init")
    }

    #[test]
    fn unaligned_set_get_round_trips() {
        let dev = register("nvram-unaligned", fresh()).expect("register");
        let payload: Vec<u8> = (0u16..300).map(|i| (i % 251) as u8).collect();
        // Straddles the lbn 0 / lbn 1 boundary at byte 512.
        dev.set(500, &payload).expect("set");
        let mut back = vec![0u8; payload.len()];
        dev.get(500, &mut back).expect("get");
        assert_eq!(back, payload);
        // Bytes around the span are untouched (zero, never written).
        let mut edge = [0xEEu8; 4];
        dev.get(496, &mut edge).expect("get");
        assert_eq!(edge, [0, 0, 0, 0]);
        unregister("nvram-unaligned");
    }

    #[test]
    fn partial_write_preserves_rest_of_block() {
        let dev = register("nvram-rmw", fresh()).expect("register");
        dev.set(0, &[0x11; 512]).expect("fill block 0");
        dev.set(100, &[0x22; 8]).expect("patch middle");
        let mut buf = [0u8; 512];
        dev.get(0, &mut buf).expect("get");
        assert!(buf[..100].iter().all(|&b| b == 0x11));
        assert!(buf[100..108].iter().all(|&b| b == 0x22));
        assert!(buf[108..].iter().all(|&b| b == 0x11));
        unregister("nvram-rmw");
    }

    #[test]
    fn out_of_bounds_span_is_rejected() {
        let dev = register("nvram-bounds", fresh()).expect("register");
        let cap = dev.capacity();
        let mut buf = [0u8; 8];
        assert!(dev.get(cap - 4, &mut buf).is_err());
        assert!(dev.set(cap - 4, &buf).is_err());
        // The very end is fine.
        assert!(dev.set(cap - 8, &buf).is_ok());
        unregister("nvram-bounds");
    }

    #[test]
    fn duplicate_names_are_rejected_and_lookup_works() {
        let _dev = register("nvram-dup", fresh()).expect("register");
        assert!(register("nvram-dup", fresh()).is_err());
        assert!(lookup("nvram-dup").is_some());
        assert!(lookup("nvram-missing").is_none());
        unregister("nvram-dup");
        assert!(lookup("nvram-dup").is_none());
    }
}
