//! Integration tests for the sub-allocation stack.
//!
//! These drive the full table/router/arena path over the heap reference
//! device, covering reuse behavior, size-class routing, and frame-boundary
//! bulk release.

use quarry::device::{HeapDevice, Lifetime, MemoryKind, ResourceDescriptor};
use quarry::memory::{AllocatorConfig, FrameAllocator, ResourceTable, SizeBucket};

fn tiny_config() -> AllocatorConfig {
    AllocatorConfig {
        buckets: vec![SizeBucket {
            threshold: 4096,
            granularity: 4096,
        }],
        ..Default::default()
    }
}

fn buffer(size: u64, lifetime: Lifetime) -> ResourceDescriptor {
    ResourceDescriptor::buffer(size, MemoryKind::DeviceLocal, lifetime)
}

// ============================================================================
// Free-range reuse
// ============================================================================

/// Release a middle placement and confirm a slightly smaller request lands
/// in the freed range instead of past the tail.
#[test]
fn test_freed_range_is_preferred_over_tail() {
    let mut table = ResourceTable::new(HeapDevice::new(), tiny_config());

    let _first = table.create(&buffer(1000, Lifetime::Permanent)).unwrap();
    let second = table.create(&buffer(2000, Lifetime::Permanent)).unwrap();
    let _third = table.create(&buffer(1000, Lifetime::Permanent)).unwrap();

    let freed_offset = table.resolve(second).offset;
    assert_eq!(freed_offset, 1024);
    table.release(second);

    // 1800 rounds to 2048 and fits the freed range exactly; it must not be
    // appended past the 4096-byte arena (which is full at the tail anyway).
    let reused = table.create(&buffer(1800, Lifetime::Permanent)).unwrap();
    assert_eq!(table.resolve(reused).offset, freed_offset);

    // Still one arena; nothing grew.
    assert_eq!(table.metrics().arena_count, 1);
}

/// Immediate release and identical re-create reuses the same range and
/// leaves the bump offset untouched.
#[test]
fn test_create_release_create_round_trip() {
    let mut table = ResourceTable::new(HeapDevice::new(), tiny_config());
    let desc = buffer(1024, Lifetime::Permanent);

    let first = table.create(&desc).unwrap();
    let offset = table.resolve(first).offset;
    table.release(first);

    let second = table.create(&desc).unwrap();
    assert_eq!(table.resolve(second).offset, offset);
    assert_eq!(table.metrics().used_bytes, 1024);
}

// ============================================================================
// Size-class routing
// ============================================================================

/// Requests above the largest tier get a dedicated arena sized to the
/// alignment-rounded request, not to bucket granularity.
#[test]
fn test_oversize_request_gets_dedicated_arena() {
    let config = AllocatorConfig::default(); // largest tier: 32MiB
    let mut table = ResourceTable::new(HeapDevice::new(), config);

    let handle = table
        .create(&buffer(64 * 1024 * 1024, Lifetime::Permanent))
        .unwrap();

    let placement = table.resolve(handle);
    assert_eq!(placement.offset, 0);
    assert_eq!(placement.size, 64 * 1024 * 1024);

    let m = table.metrics();
    assert_eq!(m.arena_count, 1);
    assert_eq!(m.reserved_bytes, 64 * 1024 * 1024);
}

/// Filling an arena exactly makes the router open a second one instead of
/// surfacing a failure.
#[test]
fn test_full_arena_rolls_over() {
    let mut table = ResourceTable::new(HeapDevice::new(), tiny_config());

    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(table.create(&buffer(1024, Lifetime::Permanent)).unwrap());
    }
    assert_eq!(table.metrics().arena_count, 1);

    let fifth = table.create(&buffer(1024, Lifetime::Permanent)).unwrap();
    assert_eq!(table.resolve(fifth).offset, 0);
    assert_eq!(table.metrics().arena_count, 2);
}

/// Incompatible descriptors never share regions.
#[test]
fn test_incompatible_requests_get_separate_arenas() {
    let mut table = ResourceTable::new(HeapDevice::new(), tiny_config());

    let _buf = table.create(&buffer(1024, Lifetime::Permanent)).unwrap();
    let _upload = table
        .create(&ResourceDescriptor::buffer(
            1024,
            MemoryKind::HostVisible,
            Lifetime::Permanent,
        ))
        .unwrap();
    let _tex = table
        .create(&ResourceDescriptor::texture_2d(
            1024,
            16,
            16,
            Lifetime::Permanent,
        ))
        .unwrap();

    assert_eq!(table.metrics().arena_count, 3);
}

// ============================================================================
// Frame boundary
// ============================================================================

/// Transients go away in bulk; permanents survive; cleared transient
/// arenas hand their regions back to the device.
#[test]
fn test_frame_boundary_bulk_release() {
    let mut table = ResourceTable::new(HeapDevice::new(), tiny_config());

    let perm = table.create(&buffer(1024, Lifetime::Permanent)).unwrap();
    for _ in 0..6 {
        table.create(&buffer(1024, Lifetime::Transient)).unwrap();
    }
    assert_eq!(table.live_count(), 7);

    table.release_all_transient();
    assert_eq!(table.live_count(), 1);
    assert_eq!(table.resolve(perm).size, 1024);
    assert_eq!(table.device().live_resources(), 1);

    table.clear_transient_arenas();
    // Permanent arena remains; the two transient arenas are gone.
    assert_eq!(table.metrics().arena_count, 1);
}

/// Frame pool drill: fill 64KiB of 1KiB records, reset, and confirm the
/// next record starts over at page 0 offset 0.
#[test]
fn test_frame_pool_reset_restarts() {
    let mut device = HeapDevice::new();
    let mut pool = FrameAllocator::new(64 * 1024, 256);

    let mut tokens = Vec::new();
    for _ in 0..64 {
        tokens.push(pool.allocate(&mut device, 1024).unwrap());
    }
    assert_eq!(pool.metrics().pages, 1);
    assert_eq!(pool.metrics().used_bytes, 64 * 1024);

    pool.reset();

    let fresh = pool.allocate(&mut device, 1024).unwrap();
    let (_, offset, _) = pool.location(fresh);
    assert_eq!(offset, 0);
    assert_eq!(pool.metrics().pages, 1);

    // Tokens from the previous frame are invalid; using one traps rather
    // than silently reading recycled bytes.
    let stale = tokens[0];
    assert!(std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = pool.as_slice(stale);
    }))
    .is_err());

    pool.teardown(&mut device);
}

// ============================================================================
// Invariants under churn
// ============================================================================

/// No two live placements in the same region ever overlap, across a long
/// create/release sequence with mixed sizes.
#[test]
fn test_no_overlap_across_churn() {
    let mut table = ResourceTable::new(HeapDevice::new(), tiny_config());
    let mut live = Vec::new();

    let mut state: u64 = 0xDEADBEEFCAFEF00D;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    for round in 0..400 {
        if round % 3 == 2 && !live.is_empty() {
            let idx = (next() % live.len() as u64) as usize;
            let handle = live.swap_remove(idx);
            table.release(handle);
        } else {
            let size = 256 + next() % 2048;
            live.push(table.create(&buffer(size, Lifetime::Permanent)).unwrap());
        }

        // Check pairwise disjointness within each region.
        for (i, &a) in live.iter().enumerate() {
            let pa = table.resolve(a);
            for &b in &live[i + 1..] {
                let pb = table.resolve(b);
                if pa.region == pb.region {
                    assert!(
                        pa.offset + pa.size <= pb.offset || pb.offset + pb.size <= pa.offset,
                        "overlapping placements"
                    );
                }
            }
        }
    }

    // Defragmentation is idempotent at any point in the churn.
    table.defragment();
    let once = table.metrics();
    table.defragment();
    assert_eq!(once, table.metrics());

    for handle in live {
        table.release(handle);
    }
    assert_eq!(table.metrics().live_placements, 0);
}

/// Every placement offset honors the device's 256-byte alignment quantum.
#[test]
fn test_all_offsets_aligned() {
    let mut table = ResourceTable::new(HeapDevice::new(), AllocatorConfig::default());

    let sizes = [1u64, 100, 255, 256, 1000, 4097, 100_000, 1_000_000];
    for &size in &sizes {
        let handle = table.create(&buffer(size, Lifetime::Permanent)).unwrap();
        let placement = table.resolve(handle);
        assert_eq!(placement.offset % 256, 0, "size {size}");
        assert_eq!(placement.size % 256, 0, "size {size}");
    }
}
