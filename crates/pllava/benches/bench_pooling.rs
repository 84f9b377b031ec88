use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use candle_core::{Device, Tensor};
use pllava::config::PoolingMethod;
use pllava::model::projector::adaptive_pool3d;

fn bench_adaptive_pool3d(c: &mut Criterion) {
    let mut group = c.benchmark_group("AdaptivePool3d");

    // (groups, frames, grid side, hidden) -> pooled (frames, side, side)
    let configs = vec![
        (1, 4, 24, 512, [4, 12, 12], "4_frames_to_4x12x12"),
        (1, 16, 24, 512, [16, 12, 12], "16_frames_to_16x12x12"),
        (2, 16, 24, 512, [8, 16, 16], "2x16_frames_to_8x16x16"),
    ];

    for (groups, frames, side, hidden, output, name) in configs {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (groups, frames, side, side, hidden), &device).unwrap();

        group.throughput(Throughput::Elements(x.elem_count() as u64));

        for method in [PoolingMethod::Avg, PoolingMethod::Max] {
            group.bench_with_input(
                BenchmarkId::new(format!("{method:?}").to_lowercase(), name),
                &x,
                |b, x| b.iter(|| black_box(adaptive_pool3d(black_box(x), output, method).unwrap())),
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_adaptive_pool3d);
criterion_main!(benches);
