//! End-to-end exercises of the translation layer on an in-memory device.
//!
//! The 8 x 4096-byte chip with 512-byte logical blocks and two log buffers
//! is the smallest geometry in which every code path (direct writes, log
//! appends, switch, merge, eviction) can fire.

#![allow(clippy::cast_possible_truncation)]

use nftl_core::{Ftl, FtlConfig, FtlError, Lbn, MemMtd};

const CHIP: u32 = 8 * 4096;
const ERASE_UNIT: u32 = 4096;
const CFG: FtlConfig = FtlConfig {
    logic_blk_size: 512,
    nb_log_blocks: 2,
    reserved_blocks: 0,
};

fn fresh() -> anyhow::Result<Ftl<MemMtd>> {
    Ok(Ftl::new(MemMtd::new(CHIP, ERASE_UNIT), CFG)?)
}

/// Per-block fill pattern, distinct across lbns and generations.
fn pattern(lbn: u32, gen: u8) -> Vec<u8> {
    (0..512u32)
        .map(|i| (lbn as u8).wrapping_mul(31) ^ gen ^ (i as u8))
        .collect()
}

fn power_cycle(ftl: Ftl<MemMtd>) -> anyhow::Result<Ftl<MemMtd>> {
    let image = ftl.into_mtd().into_image();
    Ok(Ftl::new(MemMtd::from_image(image, ERASE_UNIT), CFG)?)
}

#[test]
fn concrete_geometry_matches_hand_computation() -> anyhow::Result<()> {
    let ftl = fresh()?;
    let geo = ftl.geometry();
    // 46 raw sectors, 4 bytes of SCI each, plus a 16-byte BCI, one slack
    // sector: two header sectors, six data sectors per block.
    assert_eq!(geo.sectors_hdr, 2);
    assert_eq!(geo.sectors_per_blk, 6);
    // 8 blocks - 1 spare - 2 logs = 5 data blocks, 30 logical blocks.
    assert_eq!(geo.max_lbn, 29);
    assert_eq!(ftl.logical_block_count(), 30);
    Ok(())
}

#[test]
fn round_trip_every_logical_block() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    for lbn in 0..ftl.logical_block_count() {
        ftl.write(Lbn(lbn), &pattern(lbn, 1))?;
    }
    let mut buf = vec![0u8; 512];
    for lbn in 0..ftl.logical_block_count() {
        ftl.read(Lbn(lbn), &mut buf)?;
        assert_eq!(buf, pattern(lbn, 1), "lbn {lbn}");
    }
    Ok(())
}

#[test]
fn unwritten_blocks_read_as_zeroes() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    ftl.write(Lbn(4), &pattern(4, 1))?;
    let mut buf = vec![0xAAu8; 512];
    ftl.read(Lbn(5), &mut buf)?;
    assert!(buf.iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn data_survives_power_cycles_and_remount_is_idempotent() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    for lbn in 0..ftl.logical_block_count() {
        ftl.write(Lbn(lbn), &pattern(lbn, 7))?;
    }
    // Overwrites leave live log buffers behind; they must survive too.
    ftl.write(Lbn(0), &pattern(0, 8))?;
    ftl.write(Lbn(1), &pattern(1, 8))?;

    let mut ftl = power_cycle(ftl)?;
    assert_eq!(ftl.mount_report().reclaimed, 0, "clean image, nothing to repair");
    let mut buf = vec![0u8; 512];
    ftl.read(Lbn(0), &mut buf)?;
    assert_eq!(buf, pattern(0, 8));
    ftl.read(Lbn(1), &mut buf)?;
    assert_eq!(buf, pattern(1, 8));
    for lbn in 2..ftl.logical_block_count() {
        ftl.read(Lbn(lbn), &mut buf)?;
        assert_eq!(buf, pattern(lbn, 7), "lbn {lbn}");
    }

    // A third mount of the same image finds the identical state.
    let first = *ftl.mount_report();
    let ftl = power_cycle(ftl)?;
    assert_eq!(*ftl.mount_report(), first);
    Ok(())
}

#[test]
fn overwrite_churn_converges_to_newest_values() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    // Enough overwrites of a small working set to force log eviction and
    // repeated merges.
    for gen in 0..40u8 {
        for lbn in [0u32, 6, 12, 29] {
            ftl.write(Lbn(lbn), &pattern(lbn, gen))?;
        }
    }
    let mut ftl = power_cycle(ftl)?;
    let mut buf = vec![0u8; 512];
    for lbn in [0u32, 6, 12, 29] {
        ftl.read(Lbn(lbn), &mut buf)?;
        assert_eq!(buf, pattern(lbn, 39), "lbn {lbn}");
    }
    Ok(())
}

#[test]
fn wear_stays_level_under_single_block_hammering() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    for gen in 0..=255u8 {
        ftl.write(Lbn(3), &pattern(3, gen))?;
    }
    let wear = ftl.wear_summary()?;
    assert_eq!(wear.blocks, 8);
    // Round-robin allocation spreads erases across the pool; without it the
    // hammered block's units would absorb nearly all of the ~85 erases.
    assert!(
        wear.max - wear.min <= 8,
        "wear spread too wide: min={} max={}",
        wear.min,
        wear.max
    );
    Ok(())
}

#[test]
fn out_of_range_lbn_is_rejected_without_side_effects() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    let max = ftl.logical_block_count() - 1;
    let err = ftl.write(Lbn(max + 1), &pattern(0, 1)).unwrap_err();
    assert!(matches!(err, FtlError::OutOfRange { lbn, max: m } if lbn == max + 1 && m == max));
    let mut buf = vec![0u8; 512];
    assert!(ftl.read(Lbn(u32::MAX), &mut buf).is_err());
    // The device is untouched: a remount reports a clean image.
    let ftl = power_cycle(ftl)?;
    assert_eq!(ftl.mount_report().reclaimed, 0);
    Ok(())
}

#[test]
fn mismatched_buffer_length_is_rejected() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    assert!(ftl.write(Lbn(0), &[0u8; 100]).is_err());
    let mut short = [0u8; 100];
    assert!(ftl.read(Lbn(0), &mut short).is_err());
    Ok(())
}

#[test]
fn format_wipes_data_but_keeps_wear_counters() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    for gen in 0..30u8 {
        ftl.write(Lbn(2), &pattern(2, gen))?;
    }
    let before = ftl.wear_summary()?;
    ftl.format()?;
    let mut buf = vec![0xEEu8; 512];
    ftl.read(Lbn(2), &mut buf)?;
    assert!(buf.iter().all(|&b| b == 0));
    // Format erases every block exactly once, carrying its counter forward.
    let after = ftl.wear_summary()?;
    assert_eq!(after.blocks, 8);
    assert_eq!(after.min, before.min + 1);
    assert_eq!(after.max, before.max + 1);
    assert_eq!(after.total, before.total + 8);
    Ok(())
}

#[test]
fn garbage_image_is_reclaimed_at_mount() -> anyhow::Result<()> {
    let noise: Vec<u8> = (0..CHIP).map(|i| (i % 251) as u8).collect();
    let mut ftl = Ftl::new(MemMtd::from_image(noise, ERASE_UNIT), CFG)?;
    let mut buf = vec![0u8; 512];
    ftl.read(Lbn(0), &mut buf)?;
    assert!(buf.iter().all(|&b| b == 0));
    ftl.write(Lbn(0), &pattern(0, 1))?;
    ftl.read(Lbn(0), &mut buf)?;
    assert_eq!(buf, pattern(0, 1));
    Ok(())
}
