//! Per-frame linear allocator for transient constant data.
//!
//! The frame pool trades every feature of the arena allocator for speed:
//! allocation is a bump of an offset inside host-visible pages, there is no
//! per-allocation free, and the whole pool is recycled wholesale once per
//! frame with [`FrameAllocator::reset`]. Tokens are frame-stamped record
//! indices; a token from a previous frame is invalid by definition.
//!
//! Callers must guarantee the device has finished consuming the previous
//! frame's writes before calling `reset` — that synchronization lives in
//! the frame orchestrator, not here.

use super::config::align_up;
use crate::device::{MemoryDevice, MemoryKind, RegionId};
use crate::error::Result;
use tracing::{debug, trace};

/// Token for one frame-pool allocation.
///
/// Valid only for the frame it was issued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameToken {
    index: u32,
    frame: u64,
}

/// One allocation's metadata. Records are appended to an index-stable
/// store, so earlier tokens stay valid as new allocations arrive.
#[derive(Debug, Clone, Copy)]
struct FrameRecord {
    page: usize,
    offset: u64,
    size: u64,
}

struct FramePage {
    region: RegionId,
    /// Persistent CPU mapping of the page.
    ptr: *mut u8,
    bump: u64,
}

/// Statistics for the frame pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramePoolMetrics {
    /// Pages created since construction (pages are never destroyed until
    /// teardown).
    pub pages: usize,
    /// Allocations made in the current frame.
    pub allocations: usize,
    /// Bytes bumped in the current frame across all pages.
    pub used_bytes: u64,
    /// Largest per-frame byte usage observed.
    pub high_water_bytes: u64,
}

/// Linear (bump) allocator over host-visible pages, reset once per frame.
///
/// # Example
///
/// ```rust
/// use quarry::device::HeapDevice;
/// use quarry::memory::FrameAllocator;
///
/// let mut device = HeapDevice::new();
/// let mut pool = FrameAllocator::new(64 * 1024, 256);
///
/// let token = pool.allocate(&mut device, 128).unwrap();
/// pool.write(token, &[1, 2, 3, 4]);
/// assert_eq!(&pool.as_slice(token)[..4], &[1, 2, 3, 4]);
///
/// pool.reset(); // frame boundary: every token is now invalid
/// ```
pub struct FrameAllocator {
    pages: Vec<FramePage>,
    records: Vec<FrameRecord>,
    /// Page currently receiving bump allocations.
    current_page: usize,
    /// Monotonic frame stamp; tokens carry the stamp they were issued in.
    frame: u64,
    page_size: u64,
    alignment: u64,
    high_water_bytes: u64,
}

impl FrameAllocator {
    /// Create an empty pool. Pages are created lazily on first use.
    pub fn new(page_size: u64, alignment: u64) -> Self {
        assert!(alignment.is_power_of_two());
        assert!(page_size >= alignment && page_size % alignment == 0);
        Self {
            pages: Vec::new(),
            records: Vec::new(),
            current_page: 0,
            frame: 0,
            page_size,
            alignment,
            high_water_bytes: 0,
        }
    }

    /// Create a pool sized by the injected allocator configuration.
    pub fn from_config(config: &super::config::AllocatorConfig) -> Self {
        Self::new(config.frame_page_size, config.placement_alignment)
    }

    /// Bump-allocate `size` bytes, opening a new page if the current one
    /// cannot fit the (alignment-rounded) request.
    ///
    /// Fails with [`Error::ResourceTooLarge`] for requests larger than one
    /// page, and propagates device failures when a new page is needed.
    ///
    /// [`Error::ResourceTooLarge`]: crate::error::Error::ResourceTooLarge
    pub fn allocate<D: MemoryDevice>(
        &mut self,
        device: &mut D,
        size: u64,
    ) -> Result<FrameToken> {
        let rounded = align_up(size.max(1), self.alignment);
        if rounded > self.page_size {
            return Err(crate::error::Error::ResourceTooLarge {
                size: rounded,
                max: self.page_size,
            });
        }

        // Advance to (or create) a page with room for the request. Pages
        // before `current_page` are full for this frame and never revisited.
        loop {
            match self.pages.get_mut(self.current_page) {
                Some(page) if self.page_size - page.bump >= rounded => break,
                Some(_) => self.current_page += 1,
                None => {
                    let region = device.create_region(self.page_size, MemoryKind::HostVisible)?;
                    let ptr = device.map_region(region)?;
                    self.pages.push(FramePage {
                        region,
                        ptr,
                        bump: 0,
                    });
                    debug!(pages = self.pages.len(), "frame pool grew");
                    break;
                }
            }
        }

        let page = &mut self.pages[self.current_page];
        let offset = page.bump;
        page.bump += rounded;

        self.records.push(FrameRecord {
            page: self.current_page,
            offset,
            size: rounded,
        });

        let token = FrameToken {
            index: (self.records.len() - 1) as u32,
            frame: self.frame,
        };
        trace!(?token, offset, size = rounded, "frame allocation");
        Ok(token)
    }

    /// Copy `data` into the allocation.
    ///
    /// # Panics
    ///
    /// Panics if the token is from a previous frame or `data` exceeds the
    /// allocation size.
    pub fn write(&mut self, token: FrameToken, data: &[u8]) {
        let record = self.record(token);
        assert!(
            data.len() as u64 <= record.size,
            "write of {} bytes exceeds allocation of {}",
            data.len(),
            record.size
        );
        let dst = unsafe { self.pages[record.page].ptr.add(record.offset as usize) };
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
    }

    /// View the allocation's bytes.
    ///
    /// # Panics
    ///
    /// Panics if the token is from a previous frame.
    pub fn as_slice(&self, token: FrameToken) -> &[u8] {
        let record = self.record(token);
        let ptr = unsafe { self.pages[record.page].ptr.add(record.offset as usize) };
        unsafe { std::slice::from_raw_parts(ptr, record.size as usize) }
    }

    /// The page-relative location of an allocation, for binding constant
    /// data at draw time.
    ///
    /// # Panics
    ///
    /// Panics if the token is from a previous frame.
    pub fn location(&self, token: FrameToken) -> (RegionId, u64, u64) {
        let record = self.record(token);
        (
            self.pages[record.page].region,
            record.offset,
            record.size,
        )
    }

    /// Recycle the whole pool for the next frame.
    ///
    /// O(pages): page bump offsets rewind to zero and the record store is
    /// cleared without walking individual allocations. Every outstanding
    /// token is invalidated by the frame-stamp bump.
    pub fn reset(&mut self) {
        let used: u64 = self.pages.iter().map(|p| p.bump).sum();
        self.high_water_bytes = self.high_water_bytes.max(used);

        for page in &mut self.pages {
            page.bump = 0;
        }
        self.records.clear();
        self.current_page = 0;
        self.frame += 1;
        debug!(frame = self.frame, used, "frame pool reset");
    }

    /// Destroy all pages, returning their regions to the device.
    pub fn teardown<D: MemoryDevice>(&mut self, device: &mut D) {
        for page in self.pages.drain(..) {
            device.destroy_region(page.region);
        }
        self.records.clear();
        self.current_page = 0;
    }

    /// Snapshot pool statistics.
    pub fn metrics(&self) -> FramePoolMetrics {
        FramePoolMetrics {
            pages: self.pages.len(),
            allocations: self.records.len(),
            used_bytes: self.pages.iter().map(|p| p.bump).sum(),
            high_water_bytes: self.high_water_bytes,
        }
    }

    fn record(&self, token: FrameToken) -> FrameRecord {
        assert_eq!(
            token.frame, self.frame,
            "frame token {:?} used after reset (current frame {})",
            token, self.frame
        );
        self.records[token.index as usize]
    }
}
