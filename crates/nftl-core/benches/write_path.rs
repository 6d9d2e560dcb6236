//! Write-path throughput on an in-memory device.
//!
//! Two shapes: a sequential pass touching every logical block once (direct
//! writes, no reclamation), and repeated overwrites of one block (log
//! appends with a merge every `sectors_per_blk` writes).

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use nftl_core::{Ftl, FtlConfig, Lbn, MemMtd};

const CHIP: u32 = 64 * 4096;
const ERASE_UNIT: u32 = 4096;
const CFG: FtlConfig = FtlConfig {
    logic_blk_size: 512,
    nb_log_blocks: 2,
    reserved_blocks: 0,
};

fn fresh() -> Ftl<MemMtd> {
    match Ftl::new(MemMtd::new(CHIP, ERASE_UNIT), CFG) {
        Ok(ftl) => ftl,
        Err(err) => panic!("bench device init failed: {err}"),
    }
}

fn sequential_fill(c: &mut Criterion) {
    let blocks = fresh().logical_block_count();
    let bytes = u64::from(blocks) * 512;
    let mut group = c.benchmark_group("write_path");
    group.throughput(Throughput::Bytes(bytes));
    group.bench_function("sequential_fill", |b| {
        let data = vec![0x5Au8; 512];
        b.iter_batched(
            fresh,
            |mut ftl| {
                for lbn in 0..blocks {
                    if let Err(err) = ftl.write(Lbn(lbn), &data) {
                        panic!("write failed: {err}");
                    }
                }
                ftl
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

fn overwrite_churn(c: &mut Criterion) {
    const ROUNDS: u64 = 64;
    let mut group = c.benchmark_group("write_path");
    group.throughput(Throughput::Bytes(ROUNDS * 512));
    group.bench_function("overwrite_churn", |b| {
        let data = vec![0xA5u8; 512];
        b.iter_batched(
            fresh,
            |mut ftl| {
                for _ in 0..ROUNDS {
                    if let Err(err) = ftl.write(Lbn(17), &data) {
                        panic!("write failed: {err}");
                    }
                }
                ftl
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, sequential_fill, overwrite_churn);
criterion_main!(benches);
