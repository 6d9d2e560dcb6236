#![forbid(unsafe_code)]
//! MTD (memory-technology-device) block I/O for NorFTL.
//!
//! The FTL engine consumes flash exclusively through the [`Mtd`] trait:
//! byte-addressed reads, NOR-style programs (bits can only be cleared), and
//! erase-unit-aligned erases (bits return to 1). Two host-side
//! implementations live here:
//!
//! - [`MemMtd`] — in-RAM image with faithful NOR program/erase semantics and
//!   a power-cut injector for crash-consistency tests.
//! - [`FileMtd`] — file-backed image using pread/pwrite, so a device image
//!   survives process restarts.
//!
//! Real SPI-NOR drivers are expected to implement [`Mtd`] elsewhere; they
//! are out of scope for this workspace.

use nftl_error::{FtlError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Value of every byte in an erased region.
pub const ERASED_BYTE: u8 = 0xFF;

/// Raw flash access used by the FTL engine.
///
/// Contract (NOR semantics):
/// - `read` returns the current cell contents, any alignment.
/// - `program` may only clear bits (`new = old & data`); programming `0xFF`
///   bytes is a no-op. Any alignment.
/// - `erase` takes an erase-unit-aligned `addr` and a `len` that is a
///   multiple of the erase unit, and sets the region to `0xFF`.
///
/// Every call blocks until the operation completes. The engine assumes
/// exclusive access for the lifetime of its handle.
pub trait Mtd {
    /// Total device capacity in bytes.
    fn chip_size(&self) -> u32;

    /// Size of one erase unit in bytes.
    fn erase_unit_size(&self) -> u32;

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `data` starting at `addr` (AND onto existing contents).
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Erase `len` bytes starting at `addr`; both must be erase-unit aligned.
    fn erase(&mut self, addr: u32, len: u32) -> Result<()>;
}

fn power_cut_err() -> FtlError {
    FtlError::Io(IoError::new(ErrorKind::BrokenPipe, "simulated power cut"))
}

fn bounds_err(addr: u32, len: usize, chip: u32) -> FtlError {
    FtlError::Io(IoError::new(
        ErrorKind::InvalidInput,
        format!("mtd access out of bounds: addr={addr} len={len} chip_size={chip}"),
    ))
}

fn check_range(addr: u32, len: usize, chip: u32) -> Result<usize> {
    let end = (addr as usize)
        .checked_add(len)
        .ok_or_else(|| bounds_err(addr, len, chip))?;
    if end > chip as usize {
        return Err(bounds_err(addr, len, chip));
    }
    Ok(addr as usize)
}

fn check_erase_args(addr: u32, len: u32, unit: u32, chip: u32) -> Result<()> {
    if len == 0 || addr % unit != 0 || len % unit != 0 {
        return Err(FtlError::Io(IoError::new(
            ErrorKind::InvalidInput,
            format!("unaligned erase: addr={addr} len={len} erase_unit={unit}"),
        )));
    }
    check_range(addr, len as usize, chip).map(|_| ())
}

// ---------------------------------------------------------------------------
// In-RAM simulator
// ---------------------------------------------------------------------------

/// In-RAM NOR flash image.
///
/// Beyond plain storage it simulates the failure mode the FTL's recovery
/// protocol is designed around: a power cut part-way through a sequence of
/// programs/erases. Once armed via [`MemMtd::arm_power_cut`], a byte budget
/// counts down across mutating operations; the operation that exhausts it is
/// applied only partially and fails, and every later mutation fails without
/// touching the image. Reads keep working, so tests can remount the
/// survivor image.
#[derive(Debug, Clone)]
pub struct MemMtd {
    image: Vec<u8>,
    erase_unit: u32,
    /// Remaining mutation budget in bytes; `None` means no cut armed.
    budget: Option<u64>,
}

impl MemMtd {
    /// Create a blank (all-`0xFF`) device.
    #[must_use]
    pub fn new(chip_size: u32, erase_unit: u32) -> Self {
        assert!(
            erase_unit > 0 && chip_size % erase_unit == 0,
            "chip_size must be a multiple of erase_unit"
        );
        Self {
            image: vec![ERASED_BYTE; chip_size as usize],
            erase_unit,
            budget: None,
        }
    }

    /// Rebuild a device from a previously captured image.
    #[must_use]
    pub fn from_image(image: Vec<u8>, erase_unit: u32) -> Self {
        assert!(
            erase_unit > 0 && image.len() % erase_unit as usize == 0,
            "image length must be a multiple of erase_unit"
        );
        Self {
            image,
            erase_unit,
            budget: None,
        }
    }

    /// Current image contents.
    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Consume the device, returning the image (used to simulate a restart).
    #[must_use]
    pub fn into_image(self) -> Vec<u8> {
        self.image
    }

    /// Arm a power cut after `bytes` more mutated bytes.
    ///
    /// The mutation that crosses the budget is truncated: its first
    /// remaining bytes are applied, the rest are not, and it returns an
    /// error — exactly the torn-write shape a real power loss produces.
    pub fn arm_power_cut(&mut self, bytes: u64) {
        tracing::debug!(bytes, "power cut armed");
        self.budget = Some(bytes);
    }

    /// Disarm a pending power cut (the device "powers back up").
    pub fn disarm_power_cut(&mut self) {
        self.budget = None;
    }

    /// Whether an armed power cut has fired.
    #[must_use]
    pub fn power_cut_hit(&self) -> bool {
        self.budget == Some(0)
    }

    /// Take `want` bytes from the budget; returns how many may be applied.
    fn draw_budget(&mut self, want: usize) -> Result<usize> {
        match &mut self.budget {
            None => Ok(want),
            Some(0) => Err(power_cut_err()),
            Some(rem) => {
                let grant = usize::try_from(*rem).map_or(want, |r| r.min(want));
                *rem -= grant as u64;
                Ok(grant)
            }
        }
    }
}

impl Mtd for MemMtd {
    fn chip_size(&self) -> u32 {
        u32::try_from(self.image.len()).unwrap_or(u32::MAX)
    }

    fn erase_unit_size(&self) -> u32 {
        self.erase_unit
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let start = check_range(addr, buf.len(), self.chip_size())?;
        buf.copy_from_slice(&self.image[start..start + buf.len()]);
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let start = check_range(addr, data.len(), self.chip_size())?;
        let grant = self.draw_budget(data.len())?;
        for (cell, &byte) in self.image[start..start + grant].iter_mut().zip(data) {
            *cell &= byte;
        }
        if grant < data.len() {
            tracing::debug!(addr, applied = grant, wanted = data.len(), "torn program");
            return Err(power_cut_err());
        }
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<()> {
        check_erase_args(addr, len, self.erase_unit, self.chip_size())?;
        let start = addr as usize;
        let grant = self.draw_budget(len as usize)?;
        self.image[start..start + grant].fill(ERASED_BYTE);
        if grant < len as usize {
            tracing::debug!(addr, applied = grant, wanted = len, "torn erase");
            return Err(power_cut_err());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed image
// ---------------------------------------------------------------------------

/// File-backed NOR flash image with pread/pwrite I/O.
///
/// NOR program semantics are preserved by read-modify-AND-write, so an image
/// produced here is indistinguishable from a [`MemMtd`] snapshot.
#[derive(Debug)]
pub struct FileMtd {
    file: File,
    chip_size: u32,
    erase_unit: u32,
}

impl FileMtd {
    /// Create a new blank image file of `chip_size` bytes.
    pub fn create(path: impl AsRef<Path>, chip_size: u32, erase_unit: u32) -> Result<Self> {
        if erase_unit == 0 || chip_size % erase_unit != 0 {
            return Err(FtlError::Config(format!(
                "chip_size {chip_size} is not a multiple of erase_unit {erase_unit}"
            )));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        let unit = vec![ERASED_BYTE; erase_unit as usize];
        for _ in 0..chip_size / erase_unit {
            file.write_all(&unit)?;
        }
        file.sync_all()?;
        Ok(Self {
            file,
            chip_size,
            erase_unit,
        })
    }

    /// Open an existing image file; its length defines the chip size.
    pub fn open(path: impl AsRef<Path>, erase_unit: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        let chip_size = u32::try_from(len).map_err(|_| {
            FtlError::Config(format!("image too large for 32-bit addressing: {len} bytes"))
        })?;
        if erase_unit == 0 || chip_size % erase_unit != 0 {
            return Err(FtlError::Config(format!(
                "image length {chip_size} is not a multiple of erase_unit {erase_unit}"
            )));
        }
        Ok(Self {
            file,
            chip_size,
            erase_unit,
        })
    }
}

impl Mtd for FileMtd {
    fn chip_size(&self) -> u32 {
        self.chip_size
    }

    fn erase_unit_size(&self) -> u32 {
        self.erase_unit
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_range(addr, buf.len(), self.chip_size)?;
        self.file.read_exact_at(buf, u64::from(addr))?;
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        check_range(addr, data.len(), self.chip_size)?;
        let mut current = vec![0u8; data.len()];
        self.file.read_exact_at(&mut current, u64::from(addr))?;
        for (cell, &byte) in current.iter_mut().zip(data) {
            *cell &= byte;
        }
        self.file.write_all_at(&current, u64::from(addr))?;
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<()> {
        check_erase_args(addr, len, self.erase_unit, self.chip_size)?;
        let unit = vec![ERASED_BYTE; self.erase_unit as usize];
        let mut offset = u64::from(addr);
        for _ in 0..len / self.erase_unit {
            self.file.write_all_at(&unit, offset)?;
            offset += u64::from(self.erase_unit);
        }
        Ok(())
    }
}
