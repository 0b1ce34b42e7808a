//! Heap-backed reference device.

use super::{
    AllocationRequirements, DeviceResource, MemoryDevice, MemoryKind, RegionId, ResourceDescriptor,
};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Placement alignment the heap device reports for every descriptor.
///
/// Mirrors the 256-byte placement quantum real hardware imposes, so the
/// allocator is exercised under the same constraints in tests.
pub const HEAP_PLACEMENT_ALIGNMENT: u64 = 256;

struct HeapRegion {
    /// Boxed slice keeps the memory contiguous and at a stable address.
    data: Box<[u8]>,
    kind: MemoryKind,
}

/// A memory device backed by host heap allocations.
///
/// This is the simplest device backend, suitable for tests and headless
/// runs. Regions are zero-initialized boxed byte slices and "resources" are
/// synthetic ids; placements are still bounds- and alignment-checked so the
/// allocator's invariants get real coverage.
///
/// # Example
///
/// ```rust
/// use quarry::device::{HeapDevice, MemoryDevice, MemoryKind};
///
/// let mut device = HeapDevice::new();
/// let region = device.create_region(4096, MemoryKind::HostVisible).unwrap();
/// assert_eq!(device.live_regions(), 1);
/// device.destroy_region(region);
/// assert_eq!(device.live_regions(), 0);
/// ```
#[derive(Default)]
pub struct HeapDevice {
    regions: HashMap<u64, HeapRegion>,
    next_region: u64,
    next_resource: u64,
    live_resources: usize,
}

impl HeapDevice {
    /// Create an empty heap device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions currently alive. Useful for leak assertions.
    pub fn live_regions(&self) -> usize {
        self.regions.len()
    }

    /// Number of placed resources currently alive.
    pub fn live_resources(&self) -> usize {
        self.live_resources
    }

    fn region(&self, region: RegionId) -> &HeapRegion {
        self.regions
            .get(&region.0)
            .unwrap_or_else(|| panic!("unknown region id {}", region.0))
    }
}

impl MemoryDevice for HeapDevice {
    fn create_region(&mut self, size: u64, kind: MemoryKind) -> Result<RegionId> {
        if size == 0 {
            return Err(Error::DeviceAllocationFailed(
                "region size must be greater than 0".into(),
            ));
        }

        // Zero-initialized, like freshly reserved device memory.
        let data = vec![0u8; size as usize].into_boxed_slice();

        let id = self.next_region;
        self.next_region += 1;
        self.regions.insert(id, HeapRegion { data, kind });

        Ok(RegionId(id))
    }

    fn destroy_region(&mut self, region: RegionId) {
        let removed = self.regions.remove(&region.0);
        assert!(removed.is_some(), "destroy of unknown region {}", region.0);
    }

    fn place_resource(
        &mut self,
        region: RegionId,
        offset: u64,
        desc: &ResourceDescriptor,
    ) -> Result<DeviceResource> {
        let reqs = self.requirements(desc);
        let backing = self.region(region);

        // A misaligned or out-of-bounds placement is an allocator bug, not
        // a caller bug.
        debug_assert_eq!(
            offset % reqs.alignment,
            0,
            "placement offset {} not aligned to {}",
            offset,
            reqs.alignment
        );
        assert!(
            offset + reqs.size <= backing.data.len() as u64,
            "placement [{}, {}) exceeds region of {} bytes",
            offset,
            offset + reqs.size,
            backing.data.len()
        );

        let id = self.next_resource;
        self.next_resource += 1;
        self.live_resources += 1;

        Ok(DeviceResource::Synthetic(id))
    }

    fn destroy_resource(&mut self, _resource: DeviceResource) {
        assert!(self.live_resources > 0, "resource destroyed twice");
        self.live_resources -= 1;
    }

    fn requirements(&self, desc: &ResourceDescriptor) -> AllocationRequirements {
        AllocationRequirements {
            size: desc.size.max(1).next_multiple_of(HEAP_PLACEMENT_ALIGNMENT),
            alignment: HEAP_PLACEMENT_ALIGNMENT,
        }
    }

    fn map_region(&self, region: RegionId) -> Result<*mut u8> {
        let backing = self.region(region);
        if !backing.kind.is_host_visible() {
            return Err(Error::NotHostVisible);
        }
        Ok(backing.data.as_ptr() as *mut u8)
    }
}
