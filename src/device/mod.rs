//! Device boundary: descriptors and the memory-device trait.
//!
//! Quarry never talks to a graphics API directly. Everything it needs from
//! the device is expressed through [`MemoryDevice`]: reserving large memory
//! regions, realizing resources at an offset inside a region, querying
//! placement requirements, and mapping host-visible regions for CPU writes.
//!
//! Two implementations ship with the crate:
//!
//! - [`HeapDevice`]: host-memory reference device, used by the test suite
//!   and headless runs.
//! - `VulkanDevice` (feature `vulkan`): ash-based implementation for real
//!   GPUs.

mod heap;
#[cfg(feature = "vulkan")]
mod vulkan;

pub use heap::HeapDevice;
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanDevice;

use crate::error::Result;

/// Kind of device memory backing a region.
///
/// This is a hard allocation-time constraint: resources with different
/// memory kinds can never share a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Fast GPU-local memory. Not CPU-accessible.
    DeviceLocal,
    /// CPU-writable upload/readback memory.
    HostVisible,
}

impl MemoryKind {
    /// Can the CPU map and write this memory?
    #[inline]
    pub fn is_host_visible(&self) -> bool {
        matches!(self, MemoryKind::HostVisible)
    }
}

/// Dimensionality of a requested resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Linear buffer (vertex/index/storage data).
    Buffer,
    /// 2D texture.
    Texture2d {
        /// Width in texels.
        width: u32,
        /// Height in texels.
        height: u32,
    },
    /// Cube texture (six square faces).
    TextureCube {
        /// Edge length of each face in texels.
        extent: u32,
    },
}

impl ResourceKind {
    /// Is this a linear buffer (as opposed to an image)?
    #[inline]
    pub fn is_buffer(&self) -> bool {
        matches!(self, ResourceKind::Buffer)
    }
}

/// How long a resource lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Freed in bulk at the next frame boundary.
    Transient,
    /// Freed only by an explicit release call.
    Permanent,
}

/// Optional capability flags for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageFlags {
    /// Resource can be bound as a color render target.
    pub render_target: bool,
    /// Resource can be bound as a depth/stencil target.
    pub depth_stencil: bool,
    /// Resource supports unordered (read-write) shader access.
    pub unordered_access: bool,
}

impl UsageFlags {
    /// Is this resource a render or depth target?
    ///
    /// Target-capable resources have stricter placement requirements on
    /// most hardware, so they never share arenas with plain resources.
    #[inline]
    pub fn is_target(&self) -> bool {
        self.render_target || self.depth_stencil
    }
}

/// Semantic description of a resource request.
///
/// Immutable once submitted; the allocator derives everything (arena
/// compatibility, placement size, lifetime bookkeeping) from this.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceDescriptor {
    /// Requested size in bytes.
    pub size: u64,
    /// Buffer or texture dimensionality.
    pub kind: ResourceKind,
    /// Memory kind the resource must live in.
    pub memory: MemoryKind,
    /// Transient or permanent lifetime.
    pub lifetime: Lifetime,
    /// Capability flags.
    pub usage: UsageFlags,
}

impl ResourceDescriptor {
    /// Describe a plain buffer.
    pub fn buffer(size: u64, memory: MemoryKind, lifetime: Lifetime) -> Self {
        Self {
            size,
            kind: ResourceKind::Buffer,
            memory,
            lifetime,
            usage: UsageFlags::default(),
        }
    }

    /// Describe a 2D texture with an explicit byte size.
    pub fn texture_2d(size: u64, width: u32, height: u32, lifetime: Lifetime) -> Self {
        Self {
            size,
            kind: ResourceKind::Texture2d { width, height },
            memory: MemoryKind::DeviceLocal,
            lifetime,
            usage: UsageFlags::default(),
        }
    }

    /// Describe a cube texture with an explicit byte size.
    pub fn texture_cube(size: u64, extent: u32, lifetime: Lifetime) -> Self {
        Self {
            size,
            kind: ResourceKind::TextureCube { extent },
            memory: MemoryKind::DeviceLocal,
            lifetime,
            usage: UsageFlags::default(),
        }
    }

    /// Builder-style usage override.
    pub fn with_usage(mut self, usage: UsageFlags) -> Self {
        self.usage = usage;
        self
    }
}

/// Device-reported placement requirements for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequirements {
    /// Required allocation size in bytes (may be padded beyond the request).
    pub size: u64,
    /// Required placement alignment in bytes. Always a power of two.
    pub alignment: u64,
}

/// Opaque identifier for a device memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub(crate) u64);

/// A realized device resource, placed at some offset inside a region.
///
/// Opaque to callers; the backing representation depends on the device.
#[derive(Debug)]
pub enum DeviceResource {
    /// Synthetic resource issued by the heap reference device.
    Synthetic(u64),
    /// Vulkan buffer/image handles.
    #[cfg(feature = "vulkan")]
    Vulkan {
        /// Buffer handle, for buffer resources.
        buffer: Option<ash::vk::Buffer>,
        /// Image handle, for texture resources.
        image: Option<ash::vk::Image>,
    },
}

/// The external device capability consumed by the allocator.
///
/// Every method that touches device memory is fallible; the allocator
/// propagates failures to its caller and never retries internally.
///
/// # Contract
///
/// - Regions handed out by [`create_region`] are exclusively owned by the
///   caller until [`destroy_region`].
/// - [`place_resource`] offsets are always multiples of the alignment
///   reported by [`requirements`] for the same descriptor.
/// - [`map_region`] pointers stay valid until the region is destroyed.
///
/// [`create_region`]: MemoryDevice::create_region
/// [`destroy_region`]: MemoryDevice::destroy_region
/// [`place_resource`]: MemoryDevice::place_resource
/// [`requirements`]: MemoryDevice::requirements
/// [`map_region`]: MemoryDevice::map_region
pub trait MemoryDevice {
    /// Reserve a contiguous memory region of the given size and kind.
    ///
    /// This may be a slow, blocking device call.
    fn create_region(&mut self, size: u64, kind: MemoryKind) -> Result<RegionId>;

    /// Release a region. All resources placed in it must already be
    /// destroyed.
    fn destroy_region(&mut self, region: RegionId);

    /// Realize a resource at `offset` within `region`.
    fn place_resource(
        &mut self,
        region: RegionId,
        offset: u64,
        desc: &ResourceDescriptor,
    ) -> Result<DeviceResource>;

    /// Destroy a previously placed resource.
    fn destroy_resource(&mut self, resource: DeviceResource);

    /// Query the size and alignment the device needs to place `desc`.
    fn requirements(&self, desc: &ResourceDescriptor) -> AllocationRequirements;

    /// Map a host-visible region for CPU access.
    ///
    /// Returns [`Error::NotHostVisible`] for device-local regions.
    ///
    /// [`Error::NotHostVisible`]: crate::error::Error::NotHostVisible
    fn map_region(&self, region: RegionId) -> Result<*mut u8>;
}
