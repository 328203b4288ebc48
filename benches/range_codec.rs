//! Benchmark for the device range codec and listing parser

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::collections::BTreeSet;
use zvm_fcp_operator::hardware::{collapse_paths, collapse_to_ranges, expand_ranges, parse_fcp_devices};
use zvm_fcp_operator::FcpId;

/// Four paths of 256 devices each, split into two ranges per path
fn wide_spec() -> String {
    (0..4u16)
        .map(|path| {
            let base = 0x1a00 + path * 0x100;
            format!(
                "{:04X}-{:04X},{:04X}-{:04X}",
                base,
                base + 0x7f,
                base + 0x80,
                base + 0xff
            )
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn bench_expand(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_codec");
    let spec = wide_spec();
    group.throughput(Throughput::Elements(1024));

    group.bench_function("expand_4x256", |b| {
        b.iter(|| expand_ranges(black_box(&spec)))
    });

    group.finish();
}

fn bench_collapse(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_codec");
    group.throughput(Throughput::Elements(1024));

    // Every third device missing, so the output has many short ranges
    let sparse: BTreeSet<FcpId> = (0x1a00u16..0x1e00)
        .filter(|v| v % 3 != 0)
        .map(FcpId::from_u16)
        .collect();
    group.bench_function("collapse_sparse", |b| {
        b.iter(|| collapse_to_ranges(black_box(&sparse)))
    });

    if let Ok(paths) = expand_ranges(&wide_spec()) {
        group.bench_function("collapse_paths_4x256", |b| {
            b.iter(|| collapse_paths(black_box(&paths)))
        });
    }

    group.finish();
}

fn bench_parse_listing(c: &mut Criterion) {
    let mut group = c.benchmark_group("device_listing");
    let listing: String = (0x1a00u16..0x1b00)
        .map(|v| {
            format!(
                "opnstk1: FCP device number: {v:04X}\n\
                 opnstk1:   Status: Free\n\
                 opnstk1:   NPIV world wide port number: C05076DE3300{v:04X}\n\
                 opnstk1:   Channel path ID: 27\n\
                 opnstk1:   Physical world wide port number: C05076DE3301{v:04X}\n\
                 opnstk1:   Owner: NONE\n"
            )
        })
        .collect();
    group.throughput(Throughput::Elements(256));

    group.bench_function("parse_256_devices", |b| {
        b.iter(|| parse_fcp_devices(black_box(&listing)))
    });

    group.finish();
}

criterion_group!(benches, bench_expand, bench_collapse, bench_parse_listing);
criterion_main!(benches);
