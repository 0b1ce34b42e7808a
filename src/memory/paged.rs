//! Legacy paged allocator with packed handles.
//!
//! Predecessor of the arena/router pair, kept for the constant-data paths
//! that still address memory through a packed 64-bit handle. Pages are
//! fixed-size host-visible regions; allocation scans pages newest-first
//! for tail space, and freed ranges are threaded into an intrusive free
//! list stored inside the freed bytes themselves.
//!
//! The free list is authoritative: `allocate` consults it first-fit before
//! bumping any page tail, splitting oversized nodes when the remainder is
//! at least one quantum.
//!
//! # Handle layout
//!
//! ```text
//! 63           48 47           32 31            0
//! +--------------+---------------+---------------+
//! |  page index  |  size / 256   |  byte offset  |
//! +--------------+---------------+---------------+
//! ```
//!
//! Offsets and sizes are always multiples of the 256-byte quantum, a
//! hardware placement-alignment requirement.

use super::config::align_up;
use crate::device::{MemoryDevice, MemoryKind, RegionId};
use crate::error::{Error, Result};
use tracing::{debug, trace};

/// Allocation quantum; offsets and sizes are multiples of this.
pub const ALLOCATION_QUANTUM: u64 = 256;

/// Sentinel for "no node" in the intrusive free list.
const NO_NODE: u64 = u64::MAX;

/// Packed 64-bit handle: page index, quantized size, byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackedHandle(u64);

impl PackedHandle {
    fn new(page: usize, size: u64, offset: u64) -> Self {
        debug_assert!(page <= u16::MAX as usize);
        debug_assert_eq!(size % ALLOCATION_QUANTUM, 0);
        debug_assert!(size / ALLOCATION_QUANTUM <= u16::MAX as u64);
        debug_assert!(offset <= u32::MAX as u64);
        Self((page as u64) << 48 | (size / ALLOCATION_QUANTUM) << 32 | offset)
    }

    /// Page index this handle points into.
    pub fn page(&self) -> usize {
        (self.0 >> 48) as usize
    }

    /// Allocation size in bytes.
    pub fn size(&self) -> u64 {
        ((self.0 >> 32) & 0xFFFF) * ALLOCATION_QUANTUM
    }

    /// Byte offset within the page.
    pub fn offset(&self) -> u64 {
        self.0 & 0xFFFF_FFFF
    }

    /// The raw packed word.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Free node header written into the first bytes of a freed range.
///
/// Read and written unaligned: page base pointers only guarantee byte
/// alignment even though offsets are quantum-multiples.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct FreeNode {
    size: u64,
    /// Packed location of the next node (`page << 32 | offset`), or
    /// [`NO_NODE`].
    next: u64,
}

struct Page {
    region: RegionId,
    ptr: *mut u8,
    bump: u64,
}

/// Statistics for the paged allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagedMetrics {
    /// Number of pages.
    pub pages: usize,
    /// Bytes below the bump offsets, including freed ranges.
    pub bumped_bytes: u64,
    /// Bytes sitting in the free list.
    pub free_bytes: u64,
    /// Nodes in the free list.
    pub free_nodes: usize,
}

/// Bump-with-freelist allocator addressed via [`PackedHandle`].
pub struct PagedAllocator {
    pages: Vec<Page>,
    page_size: u64,
    /// Head of the intrusive free list, as a packed location.
    free_head: u64,
}

impl PagedAllocator {
    /// Create an empty allocator with the given page size.
    pub fn new(page_size: u64) -> Self {
        assert!(page_size >= ALLOCATION_QUANTUM);
        assert_eq!(page_size % ALLOCATION_QUANTUM, 0);
        assert!(page_size <= u32::MAX as u64, "offsets must fit 32 bits");
        Self {
            pages: Vec::new(),
            page_size,
            free_head: NO_NODE,
        }
    }

    /// Create an allocator sized by the injected allocator configuration.
    pub fn from_config(config: &super::config::AllocatorConfig) -> Self {
        Self::new(config.paged_page_size)
    }

    /// Allocate `size` bytes and return a packed handle.
    ///
    /// Consults the free list first (first-fit), then scans page tails
    /// newest-first, then creates a page.
    pub fn allocate<D: MemoryDevice>(
        &mut self,
        device: &mut D,
        size: u64,
    ) -> Result<PackedHandle> {
        let rounded = align_up(size.max(1), ALLOCATION_QUANTUM);
        let max = (u16::MAX as u64 * ALLOCATION_QUANTUM).min(self.page_size);
        if rounded > max {
            return Err(Error::ResourceTooLarge { size: rounded, max });
        }

        if let Some(handle) = self.take_from_free_list(rounded) {
            trace!(?handle, "reused freed range");
            return Ok(handle);
        }

        // Newest page first: recently created pages are the likeliest to
        // have tail space.
        for page_index in (0..self.pages.len()).rev() {
            let page = &mut self.pages[page_index];
            if self.page_size - page.bump >= rounded {
                let offset = page.bump;
                page.bump += rounded;
                return Ok(PackedHandle::new(page_index, rounded, offset));
            }
        }

        assert!(self.pages.len() <= u16::MAX as usize, "page index overflow");
        let region = device.create_region(self.page_size, MemoryKind::HostVisible)?;
        let ptr = device.map_region(region)?;
        self.pages.push(Page {
            region,
            ptr,
            bump: rounded,
        });
        debug!(pages = self.pages.len(), "paged allocator grew");

        Ok(PackedHandle::new(self.pages.len() - 1, rounded, 0))
    }

    /// Return an allocation to the free list.
    ///
    /// The freed bytes themselves hold the list node.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not decode to a range inside a page's
    /// bumped space.
    pub fn deallocate(&mut self, handle: PackedHandle) {
        let page = self
            .pages
            .get(handle.page())
            .unwrap_or_else(|| panic!("invalid handle page {}", handle.page()));
        assert!(handle.size() > 0, "invalid handle: zero size");
        assert!(
            handle.offset() + handle.size() <= page.bump,
            "invalid handle: range beyond bump offset"
        );

        let node = FreeNode {
            size: handle.size(),
            next: self.free_head,
        };
        unsafe {
            let ptr = page.ptr.add(handle.offset() as usize) as *mut FreeNode;
            std::ptr::write_unaligned(ptr, node);
        }
        self.free_head = pack_location(handle.page(), handle.offset());
        trace!(?handle, "deallocated");
    }

    /// Resolve a handle to a pointer into its page's mapped memory.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range page index.
    pub fn dereference(&self, handle: PackedHandle) -> *mut u8 {
        let page = self
            .pages
            .get(handle.page())
            .unwrap_or_else(|| panic!("invalid handle page {}", handle.page()));
        unsafe { page.ptr.add(handle.offset() as usize) }
    }

    /// Destroy all pages, returning their regions to the device.
    pub fn teardown<D: MemoryDevice>(&mut self, device: &mut D) {
        for page in self.pages.drain(..) {
            device.destroy_region(page.region);
        }
        self.free_head = NO_NODE;
    }

    /// Snapshot allocator statistics. Walks the free list.
    pub fn metrics(&self) -> PagedMetrics {
        let mut free_bytes = 0;
        let mut free_nodes = 0;
        let mut cursor = self.free_head;
        while cursor != NO_NODE {
            let node = self.read_node(cursor);
            free_bytes += node.size;
            free_nodes += 1;
            cursor = node.next;
        }
        PagedMetrics {
            pages: self.pages.len(),
            bumped_bytes: self.pages.iter().map(|p| p.bump).sum(),
            free_bytes,
            free_nodes,
        }
    }

    /// First-fit search of the intrusive free list, splitting oversized
    /// nodes.
    fn take_from_free_list(&mut self, rounded: u64) -> Option<PackedHandle> {
        let mut prev = NO_NODE;
        let mut cursor = self.free_head;

        while cursor != NO_NODE {
            let node = self.read_node(cursor);
            if node.size < rounded {
                prev = cursor;
                cursor = node.next;
                continue;
            }

            let (page, offset) = unpack_location(cursor);
            let leftover = node.size - rounded;

            // Everything is quantum-multiples, so a non-zero leftover is
            // always big enough to hold a node header.
            let successor = if leftover > 0 {
                let remainder_loc = pack_location(page, offset + rounded);
                self.write_node(
                    remainder_loc,
                    FreeNode {
                        size: leftover,
                        next: node.next,
                    },
                );
                remainder_loc
            } else {
                node.next
            };

            if prev == NO_NODE {
                self.free_head = successor;
            } else {
                let mut prev_node = self.read_node(prev);
                prev_node.next = successor;
                self.write_node(prev, prev_node);
            }

            return Some(PackedHandle::new(page, rounded, offset));
        }

        None
    }

    fn read_node(&self, loc: u64) -> FreeNode {
        let (page, offset) = unpack_location(loc);
        unsafe {
            let ptr = self.pages[page].ptr.add(offset as usize) as *const FreeNode;
            std::ptr::read_unaligned(ptr)
        }
    }

    fn write_node(&mut self, loc: u64, node: FreeNode) {
        let (page, offset) = unpack_location(loc);
        unsafe {
            let ptr = self.pages[page].ptr.add(offset as usize) as *mut FreeNode;
            std::ptr::write_unaligned(ptr, node);
        }
    }
}

fn pack_location(page: usize, offset: u64) -> u64 {
    (page as u64) << 32 | offset
}

fn unpack_location(loc: u64) -> (usize, u64) {
    ((loc >> 32) as usize, loc & 0xFFFF_FFFF)
}
