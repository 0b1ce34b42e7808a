//! # Quarry
//!
//! GPU memory sub-allocation for game-style renderers.
//!
//! Quarry reserves large fixed-size memory regions from a graphics device
//! and carves them into individually placed resources: buffers, textures,
//! and per-frame constant data. Freed space is reused through per-arena
//! free lists and adjacent-range coalescing, so the region pool stays
//! bounded instead of fragmenting without limit.
//!
//! ## Components
//!
//! - **Arenas** own one region each, with bump allocation plus a best-fit
//!   free set for reuse.
//! - The **router** buckets arenas by compatibility (memory kind, usage
//!   class, size tier, lifetime) and creates them lazily.
//! - The **resource table** issues opaque generation-tagged handles and
//!   realizes device resources at routed placements.
//! - The **frame allocator** bump-allocates transient constant data and is
//!   recycled wholesale once per frame.
//! - The **paged allocator** is the legacy packed-handle path kept for old
//!   constant-data call sites.
//!
//! ## Quick Start
//!
//! ```rust
//! use quarry::prelude::*;
//!
//! let mut table = ResourceTable::new(HeapDevice::new(), AllocatorConfig::default());
//!
//! let desc = ResourceDescriptor::buffer(64 * 1024, MemoryKind::DeviceLocal, Lifetime::Permanent);
//! let handle = table.create(&desc)?;
//! let placement = table.resolve(handle);
//! assert_eq!(placement.offset % 256, 0);
//!
//! table.release(handle);
//! # Ok::<(), quarry::Error>(())
//! ```
//!
//! All allocator state lives on one thread; the only external calls are to
//! the [`device::MemoryDevice`] boundary, which is synchronous and
//! fallible.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod device;
pub mod error;
pub mod memory;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::device::{
        HeapDevice, Lifetime, MemoryDevice, MemoryKind, ResourceDescriptor, ResourceKind,
        UsageFlags,
    };
    pub use crate::error::{Error, Result};
    pub use crate::memory::{
        AllocatorConfig, FrameAllocator, PagedAllocator, ResourceHandle, ResourceTable,
    };
}

pub use error::{Error, Result};
