//! Sub-allocation benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quarry::device::{HeapDevice, Lifetime, MemoryKind, ResourceDescriptor};
use quarry::memory::{AllocatorConfig, FrameAllocator, PagedAllocator, ResourceTable};

fn bench_create_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_create_release");

    for size in [1024u64, 64 * 1024, 1024 * 1024] {
        let mut table = ResourceTable::new(HeapDevice::new(), AllocatorConfig::default());
        let desc = ResourceDescriptor::buffer(size, MemoryKind::DeviceLocal, Lifetime::Permanent);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &desc, |b, desc| {
            b.iter(|| {
                let handle = table.create(desc).expect("create succeeds");
                table.release(handle);
            });
        });
    }

    group.finish();
}

fn bench_frame_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_pool");

    let mut device = HeapDevice::new();
    let mut pool = FrameAllocator::new(256 * 1024, 256);

    group.throughput(Throughput::Elements(128));
    group.bench_function("128_allocations_per_frame", |b| {
        b.iter(|| {
            for _ in 0..128 {
                let token = pool.allocate(&mut device, 512).expect("page fits");
                std::hint::black_box(token);
            }
            pool.reset();
        });
    });

    group.finish();
}

fn bench_paged_allocator(c: &mut Criterion) {
    let mut group = c.benchmark_group("paged_allocator");

    let mut device = HeapDevice::new();
    let mut alloc = PagedAllocator::new(2 * 1024 * 1024);

    group.throughput(Throughput::Elements(1));
    group.bench_function("allocate_deallocate_1k", |b| {
        b.iter(|| {
            let handle = alloc.allocate(&mut device, 1024).expect("page fits");
            alloc.deallocate(handle);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_create_release,
    bench_frame_pool,
    bench_paged_allocator
);
criterion_main!(benches);
