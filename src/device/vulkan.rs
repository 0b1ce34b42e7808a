//! Vulkan memory device.
//!
//! Implements [`MemoryDevice`] over ash: regions are `VkDeviceMemory`
//! allocations, placements are buffers/images bound at an offset, and
//! host-visible regions stay persistently mapped.

use super::{
    AllocationRequirements, DeviceResource, MemoryDevice, MemoryKind, RegionId, ResourceDescriptor,
    ResourceKind,
};
use crate::error::{Error, Result};

use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

/// Placement alignment the Vulkan device reports.
///
/// 256 bytes satisfies `minUniformBufferOffsetAlignment` and
/// `bufferImageGranularity` on the hardware this engine targets.
const VULKAN_PLACEMENT_ALIGNMENT: u64 = 256;

struct VulkanRegion {
    memory: vk::DeviceMemory,
    /// Persistent mapping, present only for host-visible regions.
    mapped: Option<*mut u8>,
}

/// Vulkan implementation of the memory-device boundary.
///
/// One `VkDeviceMemory` allocation per region; the allocator above decides
/// how regions are carved up, this type only executes placements.
pub struct VulkanDevice {
    device: Arc<ash::Device>,
    /// Memory type index for device-local memory.
    device_local_memory_type: u32,
    /// Memory type index for host-visible memory.
    host_visible_memory_type: u32,
    regions: HashMap<u64, VulkanRegion>,
    next_region: u64,
}

impl VulkanDevice {
    /// Create a Vulkan memory device from an existing instance and device.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        // Query memory properties
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let device_local_memory_type = Self::find_memory_type(
            &memory_properties,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        )
        .ok_or_else(|| {
            Error::DeviceAllocationFailed("no device-local memory type found".to_string())
        })?;

        let host_visible_memory_type = Self::find_memory_type(
            &memory_properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::empty(),
        )
        .ok_or_else(|| {
            Error::DeviceAllocationFailed("no host-visible memory type found".to_string())
        })?;

        Ok(Self {
            device,
            device_local_memory_type,
            host_visible_memory_type,
            regions: HashMap::new(),
            next_region: 0,
        })
    }

    /// Find a memory type index matching the requirements.
    fn find_memory_type(
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        required_flags: vk::MemoryPropertyFlags,
        preferred_flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let mut best_match = None;
        let mut best_score = 0;

        for i in 0..memory_properties.memory_type_count {
            let memory_type = memory_properties.memory_types[i as usize];

            if memory_type.property_flags.contains(required_flags) {
                let mut score = 1;

                if memory_type.property_flags.contains(preferred_flags) {
                    score += 10;
                }

                if score > best_score {
                    best_score = score;
                    best_match = Some(i);
                }
            }
        }

        best_match
    }

    fn region(&self, region: RegionId) -> &VulkanRegion {
        self.regions
            .get(&region.0)
            .unwrap_or_else(|| panic!("unknown region id {}", region.0))
    }

    fn buffer_usage(desc: &ResourceDescriptor) -> vk::BufferUsageFlags {
        let mut usage = vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;
        if desc.usage.unordered_access {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        usage
    }

    fn image_usage(desc: &ResourceDescriptor) -> vk::ImageUsageFlags {
        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        if desc.usage.render_target {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if desc.usage.depth_stencil {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if desc.usage.unordered_access {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        usage
    }

    fn image_format(desc: &ResourceDescriptor) -> vk::Format {
        if desc.usage.depth_stencil {
            vk::Format::D32_SFLOAT
        } else {
            vk::Format::R8G8B8A8_UNORM
        }
    }

    fn place_image(
        &mut self,
        region: RegionId,
        offset: u64,
        desc: &ResourceDescriptor,
        extent: vk::Extent3D,
        layers: u32,
        flags: vk::ImageCreateFlags,
    ) -> Result<DeviceResource> {
        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(Self::image_format(desc))
            .extent(extent)
            .mip_levels(1)
            .array_layers(layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(Self::image_usage(desc))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            self.device.create_image(&image_info, None).map_err(|e| {
                Error::DeviceAllocationFailed(format!("failed to create image: {:?}", e))
            })?
        };

        let memory = self.region(region).memory;
        unsafe {
            self.device
                .bind_image_memory(image, memory, offset)
                .map_err(|e| {
                    self.device.destroy_image(image, None);
                    Error::DeviceAllocationFailed(format!("failed to bind image memory: {:?}", e))
                })?;
        }

        Ok(DeviceResource::Vulkan {
            buffer: None,
            image: Some(image),
        })
    }
}

impl MemoryDevice for VulkanDevice {
    fn create_region(&mut self, size: u64, kind: MemoryKind) -> Result<RegionId> {
        let memory_type = match kind {
            MemoryKind::DeviceLocal => self.device_local_memory_type,
            MemoryKind::HostVisible => self.host_visible_memory_type,
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);

        let memory = unsafe {
            self.device
                .allocate_memory(&alloc_info, None)
                .map_err(|e| {
                    Error::DeviceAllocationFailed(format!("vkAllocateMemory failed: {:?}", e))
                })?
        };

        // Host-visible regions stay persistently mapped.
        let mapped = if kind.is_host_visible() {
            let ptr = unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(|e| {
                        self.device.free_memory(memory, None);
                        Error::DeviceAllocationFailed(format!("failed to map memory: {:?}", e))
                    })?
            };
            Some(ptr as *mut u8)
        } else {
            None
        };

        let id = self.next_region;
        self.next_region += 1;
        self.regions.insert(id, VulkanRegion { memory, mapped });

        Ok(RegionId(id))
    }

    fn destroy_region(&mut self, region: RegionId) {
        let removed = self
            .regions
            .remove(&region.0)
            .unwrap_or_else(|| panic!("destroy of unknown region {}", region.0));
        unsafe {
            if removed.mapped.is_some() {
                self.device.unmap_memory(removed.memory);
            }
            self.device.free_memory(removed.memory, None);
        }
    }

    fn place_resource(
        &mut self,
        region: RegionId,
        offset: u64,
        desc: &ResourceDescriptor,
    ) -> Result<DeviceResource> {
        debug_assert_eq!(offset % VULKAN_PLACEMENT_ALIGNMENT, 0);

        match desc.kind {
            ResourceKind::Buffer => {
                let buffer_info = vk::BufferCreateInfo::default()
                    .size(desc.size)
                    .usage(Self::buffer_usage(desc))
                    .sharing_mode(vk::SharingMode::EXCLUSIVE);

                let buffer = unsafe {
                    self.device.create_buffer(&buffer_info, None).map_err(|e| {
                        Error::DeviceAllocationFailed(format!("failed to create buffer: {:?}", e))
                    })?
                };

                let memory = self.region(region).memory;
                unsafe {
                    self.device
                        .bind_buffer_memory(buffer, memory, offset)
                        .map_err(|e| {
                            self.device.destroy_buffer(buffer, None);
                            Error::DeviceAllocationFailed(format!(
                                "failed to bind buffer memory: {:?}",
                                e
                            ))
                        })?;
                }

                Ok(DeviceResource::Vulkan {
                    buffer: Some(buffer),
                    image: None,
                })
            }
            ResourceKind::Texture2d { width, height } => self.place_image(
                region,
                offset,
                desc,
                vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
                1,
                vk::ImageCreateFlags::empty(),
            ),
            ResourceKind::TextureCube { extent } => self.place_image(
                region,
                offset,
                desc,
                vk::Extent3D {
                    width: extent,
                    height: extent,
                    depth: 1,
                },
                6,
                vk::ImageCreateFlags::CUBE_COMPATIBLE,
            ),
        }
    }

    fn destroy_resource(&mut self, resource: DeviceResource) {
        if let DeviceResource::Vulkan { buffer, image } = resource {
            unsafe {
                if let Some(buf) = buffer {
                    self.device.destroy_buffer(buf, None);
                }
                if let Some(img) = image {
                    self.device.destroy_image(img, None);
                }
            }
        }
    }

    fn requirements(&self, desc: &ResourceDescriptor) -> AllocationRequirements {
        AllocationRequirements {
            size: desc
                .size
                .max(1)
                .next_multiple_of(VULKAN_PLACEMENT_ALIGNMENT),
            alignment: VULKAN_PLACEMENT_ALIGNMENT,
        }
    }

    fn map_region(&self, region: RegionId) -> Result<*mut u8> {
        self.region(region).mapped.ok_or(Error::NotHostVisible)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        for (_, region) in self.regions.drain() {
            unsafe {
                if region.mapped.is_some() {
                    self.device.unmap_memory(region.memory);
                }
                self.device.free_memory(region.memory, None);
            }
        }
    }
}
