//! Size-class routing: grouping arenas by compatibility key.
//!
//! The router derives an [`ArenaKey`] from each request and keeps, per key,
//! a list of arenas in creation order. A request tries each arena in that
//! order and takes the first successful placement — deterministic and
//! simple, which matters more here than a cleverer search. When no arena
//! fits, a new one is created at the key's bucket granularity (or sized to
//! the request exactly when it exceeds the largest tier).
//!
//! Arenas never shrink. Permanent-key arenas live until teardown; the
//! transient keys can be dropped wholesale at a designated point once
//! their placements are gone.

use super::arena::{Arena, ArenaMetrics};
use super::config::{align_up, AllocatorConfig};
use crate::device::{MemoryDevice, MemoryKind, RegionId, ResourceDescriptor};
use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::debug;

/// Compatibility key deciding which arenas may host a request.
///
/// Derived purely from the descriptor. Two descriptors with the same key
/// may share an arena; different keys never do, because memory kind and
/// usage class are hard allocation-time constraints of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaKey {
    /// Memory kind of the backing region.
    pub memory: MemoryKind,
    /// Buffers and images never share arenas.
    pub is_buffer: bool,
    /// Render/depth targets have stricter placement rules.
    pub is_target: bool,
    /// Index into the bucket table; `buckets.len()` marks a dedicated
    /// oversize arena.
    pub bucket: usize,
    /// Transient resources are grouped so their arenas can be dropped in
    /// bulk.
    pub transient: bool,
}

/// A placement produced by the router: which arena, where, and how big.
#[derive(Debug, Clone, Copy)]
pub struct ArenaPlacement {
    /// Compatibility key of the hosting arena.
    pub key: ArenaKey,
    /// Index of the arena within its key's list (creation order).
    pub arena_index: usize,
    /// Backing device region of the hosting arena.
    pub region: RegionId,
    /// Byte offset within the region.
    pub offset: u64,
    /// Placement size in bytes (alignment-rounded).
    pub size: u64,
}

/// Aggregate utilization snapshot across all arenas.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RouterMetrics {
    /// Number of arenas across all keys.
    pub arena_count: usize,
    /// Sum of all arena sizes.
    pub reserved_bytes: u64,
    /// Bytes carved out for live placements.
    pub used_bytes: u64,
    /// Placements currently alive.
    pub live_placements: usize,
}

/// Groups arenas by compatibility key and finds or creates a host for each
/// request.
pub struct Router {
    config: AllocatorConfig,
    arenas: HashMap<ArenaKey, SmallVec<[Arena; 2]>>,
}

impl Router {
    /// Create a router with the given (validated) configuration.
    pub fn new(config: AllocatorConfig) -> Self {
        config.validate();
        Self {
            config,
            arenas: HashMap::new(),
        }
    }

    /// The injected configuration.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Find or create an arena for `desc` and place into it.
    ///
    /// The device is consulted for size/alignment requirements; the rounded
    /// size is what gets carved. May create a new region on the device,
    /// which is the only fallible step.
    pub fn acquire<D: MemoryDevice>(
        &mut self,
        device: &mut D,
        desc: &ResourceDescriptor,
    ) -> Result<ArenaPlacement> {
        let reqs = device.requirements(desc);
        let alignment = self.config.placement_alignment.max(reqs.alignment);
        let size = align_up(reqs.size, alignment);

        if size > self.config.max_resource_size {
            return Err(Error::ResourceTooLarge {
                size,
                max: self.config.max_resource_size,
            });
        }

        let key = self.key_for(desc, size);
        let arenas = self.arenas.entry(key).or_default();

        // First match in creation order.
        for (arena_index, arena) in arenas.iter_mut().enumerate() {
            if let Some(offset) = arena.try_place(size) {
                return Ok(ArenaPlacement {
                    key,
                    arena_index,
                    region: arena.region(),
                    offset,
                    size,
                });
            }
        }

        // No arena fits; create one. Bucketed keys get the tier's fixed
        // granularity, oversize requests get an exact-size dedicated arena.
        let arena_size = match self.config.buckets.get(key.bucket) {
            Some(bucket) => bucket.granularity,
            None => size,
        };

        let region = device.create_region(arena_size, key.memory)?;
        let mut arena = Arena::new(region, arena_size, alignment);
        debug!(
            ?key,
            arena_size,
            arena_index = arenas.len(),
            "created arena"
        );

        // Fresh arena at bucket granularity always fits by construction.
        let offset = arena
            .try_place(size)
            .expect("new arena must host the request that created it");

        arenas.push(arena);
        Ok(ArenaPlacement {
            key,
            arena_index: arenas.len() - 1,
            region,
            offset,
            size,
        })
    }

    /// Return a placement's range to its arena.
    pub fn release(&mut self, placement: &ArenaPlacement) {
        let arena = self.arena_mut(placement.key, placement.arena_index);
        arena.release(placement.offset, placement.size);
    }

    /// Coalesce free ranges in every arena.
    pub fn defragment(&mut self) {
        for arenas in self.arenas.values_mut() {
            for arena in arenas.iter_mut() {
                arena.defragment();
            }
        }
    }

    /// Drop every transient-key arena, returning regions to the device.
    ///
    /// # Panics
    ///
    /// Panics if any transient placement is still alive; callers must bulk-
    /// release transients first.
    pub fn clear_transient<D: MemoryDevice>(&mut self, device: &mut D) {
        let transient_keys: Vec<ArenaKey> = self
            .arenas
            .keys()
            .filter(|k| k.transient)
            .copied()
            .collect();

        for key in transient_keys {
            let arenas = self.arenas.remove(&key).unwrap();
            for arena in arenas {
                assert_eq!(
                    arena.live_placements(),
                    0,
                    "transient arena cleared with live placements"
                );
                device.destroy_region(arena.region());
            }
            debug!(?key, "cleared transient arenas");
        }
    }

    /// Tear down all arenas, returning every region to the device.
    pub fn teardown<D: MemoryDevice>(&mut self, device: &mut D) {
        for (_, arenas) in self.arenas.drain() {
            for arena in arenas {
                device.destroy_region(arena.region());
            }
        }
    }

    /// Aggregate metrics across all arenas.
    pub fn metrics(&self) -> RouterMetrics {
        let mut out = RouterMetrics::default();
        for arena in self.arenas.values().flatten() {
            let m = arena.metrics();
            out.arena_count += 1;
            out.reserved_bytes += m.size;
            out.used_bytes += m.used_bytes();
            out.live_placements += m.live_placements;
        }
        out
    }

    /// Per-arena metrics for one key, in creation order. Test helper.
    pub fn arena_metrics(&self, key: ArenaKey) -> Vec<ArenaMetrics> {
        self.arenas
            .get(&key)
            .map(|arenas| arenas.iter().map(Arena::metrics).collect())
            .unwrap_or_default()
    }

    /// Derive the compatibility key for a rounded request size.
    pub fn key_for(&self, desc: &ResourceDescriptor, size: u64) -> ArenaKey {
        ArenaKey {
            memory: desc.memory,
            is_buffer: desc.kind.is_buffer(),
            is_target: desc.usage.is_target(),
            bucket: self
                .config
                .bucket_for(size)
                .unwrap_or(self.config.buckets.len()),
            transient: matches!(desc.lifetime, crate::device::Lifetime::Transient),
        }
    }

    fn arena_mut(&mut self, key: ArenaKey, index: usize) -> &mut Arena {
        self.arenas
            .get_mut(&key)
            .and_then(|arenas| arenas.get_mut(index))
            .unwrap_or_else(|| panic!("unknown arena {:?}[{}]", key, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HeapDevice, Lifetime};
    use crate::memory::config::SizeBucket;

    fn small_config() -> AllocatorConfig {
        AllocatorConfig {
            buckets: vec![SizeBucket {
                threshold: 4096,
                granularity: 4096,
            }],
            ..Default::default()
        }
    }

    fn buffer(size: u64) -> ResourceDescriptor {
        ResourceDescriptor::buffer(size, MemoryKind::DeviceLocal, Lifetime::Permanent)
    }

    #[test]
    fn test_keys_separate_incompatible_requests() {
        let router = Router::new(AllocatorConfig::default());

        let device_buf = buffer(1024);
        let host_buf =
            ResourceDescriptor::buffer(1024, MemoryKind::HostVisible, Lifetime::Permanent);
        let texture = ResourceDescriptor::texture_2d(1024, 16, 16, Lifetime::Permanent);
        let transient_buf =
            ResourceDescriptor::buffer(1024, MemoryKind::DeviceLocal, Lifetime::Transient);

        let base = router.key_for(&device_buf, 1024);
        assert_ne!(base, router.key_for(&host_buf, 1024));
        assert_ne!(base, router.key_for(&texture, 1024));
        assert_ne!(base, router.key_for(&transient_buf, 1024));

        // Same descriptor in a different tier gets a different key.
        assert_ne!(base, router.key_for(&device_buf, 8 * 1024 * 1024));
    }

    #[test]
    fn test_same_key_shares_arena() {
        let mut device = HeapDevice::new();
        let mut router = Router::new(small_config());

        let a = router.acquire(&mut device, &buffer(1024)).unwrap();
        let b = router.acquire(&mut device, &buffer(1024)).unwrap();

        assert_eq!(a.key, b.key);
        assert_eq!(a.arena_index, b.arena_index);
        assert_eq!(device.live_regions(), 1);
    }

    #[test]
    fn test_new_arena_when_full() {
        let mut device = HeapDevice::new();
        let mut router = Router::new(small_config());

        // Fill the first 4096-byte arena exactly.
        for _ in 0..4 {
            router.acquire(&mut device, &buffer(1024)).unwrap();
        }
        assert_eq!(device.live_regions(), 1);

        // Next request opens a second arena instead of failing.
        let p = router.acquire(&mut device, &buffer(1024)).unwrap();
        assert_eq!(p.arena_index, 1);
        assert_eq!(p.offset, 0);
        assert_eq!(device.live_regions(), 2);
    }

    #[test]
    fn test_first_match_in_creation_order() {
        let mut device = HeapDevice::new();
        let mut router = Router::new(small_config());

        // Two arenas, first one full.
        let mut first_arena = Vec::new();
        for _ in 0..4 {
            first_arena.push(router.acquire(&mut device, &buffer(1024)).unwrap());
        }
        let _second = router.acquire(&mut device, &buffer(1024)).unwrap();

        // Free a slot in arena 0; the next request must land there, not in
        // arena 1's ample tail space.
        router.release(&first_arena[1]);
        let p = router.acquire(&mut device, &buffer(1024)).unwrap();
        assert_eq!(p.arena_index, 0);
        assert_eq!(p.offset, first_arena[1].offset);
    }

    #[test]
    fn test_oversize_gets_dedicated_exact_arena() {
        let mut device = HeapDevice::new();
        let mut router = Router::new(small_config());

        // 10_000 exceeds the 4096 threshold: dedicated arena, exact
        // alignment-rounded size, not bucket granularity.
        let p = router.acquire(&mut device, &buffer(10_000)).unwrap();
        assert_eq!(p.size, 10_240);
        assert_eq!(p.offset, 0);
        assert_eq!(p.key.bucket, 1); // past the last tier

        let metrics = router.arena_metrics(p.key);
        assert_eq!(metrics[0].size, 10_240);
    }

    #[test]
    fn test_alignment_rounding() {
        let mut device = HeapDevice::new();
        let mut router = Router::new(small_config());

        let p = router.acquire(&mut device, &buffer(1000)).unwrap();
        assert_eq!(p.size, 1024);
        assert_eq!(p.offset % 256, 0);
    }

    #[test]
    fn test_too_large_is_recoverable() {
        let mut device = HeapDevice::new();
        let mut router = Router::new(AllocatorConfig {
            max_resource_size: 1024 * 1024,
            ..small_config()
        });

        let err = router
            .acquire(&mut device, &buffer(2 * 1024 * 1024))
            .unwrap_err();
        assert!(matches!(err, Error::ResourceTooLarge { .. }));

        // The router is still usable afterwards.
        assert!(router.acquire(&mut device, &buffer(1024)).is_ok());
    }

    #[test]
    fn test_clear_transient() {
        let mut device = HeapDevice::new();
        let mut router = Router::new(small_config());

        let transient =
            ResourceDescriptor::buffer(1024, MemoryKind::DeviceLocal, Lifetime::Transient);
        let p = router.acquire(&mut device, &transient).unwrap();
        let _perm = router.acquire(&mut device, &buffer(1024)).unwrap();
        assert_eq!(device.live_regions(), 2);

        router.release(&p);
        router.clear_transient(&mut device);

        // Transient arena gone, permanent arena untouched.
        assert_eq!(device.live_regions(), 1);
        assert_eq!(router.metrics().arena_count, 1);
    }

    #[test]
    fn test_teardown_returns_all_regions() {
        let mut device = HeapDevice::new();
        let mut router = Router::new(small_config());

        for _ in 0..6 {
            router.acquire(&mut device, &buffer(2048)).unwrap();
        }
        assert_eq!(device.live_regions(), 3);

        router.teardown(&mut device);
        assert_eq!(device.live_regions(), 0);
    }

    #[test]
    fn test_metrics_aggregate() {
        let mut device = HeapDevice::new();
        let mut router = Router::new(small_config());

        let p = router.acquire(&mut device, &buffer(1024)).unwrap();
        let _q = router.acquire(&mut device, &buffer(1024)).unwrap();
        router.release(&p);

        let m = router.metrics();
        assert_eq!(m.arena_count, 1);
        assert_eq!(m.reserved_bytes, 4096);
        assert_eq!(m.live_placements, 1);
        assert_eq!(m.used_bytes, 1024);
    }
}
