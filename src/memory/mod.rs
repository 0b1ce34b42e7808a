//! Memory sub-allocation for Quarry.
//!
//! This module carves large fixed-size device-memory regions into
//! individually placed resources and tracks their lifetime.
//!
//! # Architecture
//!
//! - [`Arena`]: one region with a bump offset and a best-fit free set
//! - [`Router`]: groups arenas by compatibility key, finds or creates a
//!   host for each request
//! - [`ResourceTable`]: opaque generation-tagged handles over routed
//!   placements; owns the device
//! - [`FrameAllocator`]: per-frame bump pool for transient constant data
//! - [`PagedAllocator`]: legacy bump-with-freelist allocator addressed by
//!   packed 64-bit handles
//!
//! # Example
//!
//! ```rust
//! use quarry::device::{HeapDevice, Lifetime, MemoryKind, ResourceDescriptor};
//! use quarry::memory::{AllocatorConfig, ResourceTable};
//!
//! let mut table = ResourceTable::new(HeapDevice::new(), AllocatorConfig::default());
//!
//! let desc = ResourceDescriptor::buffer(64 * 1024, MemoryKind::DeviceLocal, Lifetime::Transient);
//! let handle = table.create(&desc).unwrap();
//! let offset = table.resolve(handle).offset;
//!
//! // Frame boundary: transients go away in bulk.
//! table.release_all_transient();
//! # let _ = offset;
//! ```

pub mod config;

mod arena;
mod frame;
mod paged;
mod router;
mod table;

pub use arena::{Arena, ArenaMetrics, FreeRange};
pub use config::{align_up, AllocatorConfig, SizeBucket};
pub use frame::{FrameAllocator, FramePoolMetrics, FrameToken};
pub use paged::{PackedHandle, PagedAllocator, PagedMetrics, ALLOCATION_QUANTUM};
pub use router::{ArenaKey, ArenaPlacement, Router, RouterMetrics};
pub use table::{Placement, ResourceHandle, ResourceTable};
