//! Fixed-size device-memory arena with bump and free-list placement.
//!
//! An [`Arena`] owns one contiguous region obtained from the device and
//! carves placements out of it two ways:
//!
//! - **Free-range reuse**: a size-ordered set of previously released
//!   sub-ranges is searched best-fit first.
//! - **Bump fallback**: if no freed range fits, the tail offset is advanced.
//!
//! Releases that touch the tail retract the bump offset instead of growing
//! the free set, so the common LIFO-release pattern never fragments.
//! [`Arena::defragment`] coalesces whatever fragmentation remains.
//!
//! `try_place` returning `None` is not an error; it means "this arena
//! cannot host the request" and the router moves on to another arena.

use crate::device::RegionId;
use std::collections::BTreeMap;
use tracing::trace;

/// A free sub-range inside an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    /// Byte offset of the range start.
    pub offset: u64,
    /// Length of the range in bytes.
    pub size: u64,
}

/// Utilization snapshot for one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaMetrics {
    /// Total region size in bytes.
    pub size: u64,
    /// Current bump offset (high-water mark of tail allocation).
    pub bump_offset: u64,
    /// Bytes sitting in the free set, reusable without bumping.
    pub free_bytes: u64,
    /// Number of disjoint free ranges.
    pub free_ranges: usize,
    /// Placements currently alive in this arena.
    pub live_placements: usize,
}

impl ArenaMetrics {
    /// Bytes currently carved out for live placements.
    pub fn used_bytes(&self) -> u64 {
        self.bump_offset - self.free_bytes
    }

    /// Utilization as a percentage of total size.
    pub fn utilization_percent(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 / self.size as f64 * 100.0
    }
}

/// One fixed-size memory region subdivided by the allocator.
///
/// The arena tracks geometry only (offsets and sizes); realizing device
/// resources at those offsets is the handle table's job. The backing
/// [`RegionId`] is exclusively owned and handed back to the device when
/// the router tears the arena down.
#[derive(Debug)]
pub struct Arena {
    region: RegionId,
    size: u64,
    /// Tail offset; everything below it is either live or in the free set.
    bump: u64,
    /// Free ranges keyed by size, for best-fit lookup. Multiple ranges of
    /// the same size stack in the value vector.
    free: BTreeMap<u64, Vec<u64>>,
    /// Sum of all sizes in `free`.
    free_bytes: u64,
    /// Live placements carved from this arena.
    live: usize,
    /// Placement alignment quantum; every offset and size handled here is
    /// a multiple of this.
    alignment: u64,
}

impl Arena {
    /// Wrap a device region of `size` bytes as an empty arena.
    pub fn new(region: RegionId, size: u64, alignment: u64) -> Self {
        debug_assert!(alignment.is_power_of_two());
        debug_assert_eq!(size % alignment, 0, "arena size must be quantized");
        Self {
            region,
            size,
            bump: 0,
            free: BTreeMap::new(),
            free_bytes: 0,
            live: 0,
            alignment,
        }
    }

    /// The backing device region.
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Total region size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Placements currently alive in this arena.
    pub fn live_placements(&self) -> usize {
        self.live
    }

    /// Try to carve `size` bytes out of this arena.
    ///
    /// Searches the free set for the smallest range that fits (best-fit);
    /// any remainder is re-inserted as a smaller free range. Falls back to
    /// bumping the tail. Returns `None` if neither works — the arena simply
    /// cannot host this request.
    ///
    /// `size` must already be rounded to the alignment quantum.
    pub fn try_place(&mut self, size: u64) -> Option<u64> {
        debug_assert!(size > 0);
        debug_assert_eq!(size % self.alignment, 0, "unquantized placement size");

        // Best fit: smallest free range that can hold the request.
        if let Some((&range_size, _)) = self.free.range(size..).next() {
            let offset = self.pop_free(range_size);
            self.free_bytes -= range_size;

            let remainder = range_size - size;
            if remainder > 0 {
                self.insert_free(offset + size, remainder);
                self.free_bytes += remainder;
            }

            self.live += 1;
            trace!(offset, size, reused = range_size, "placed from free range");
            return Some(offset);
        }

        // Bump fallback.
        if self.size - self.bump >= size {
            let offset = self.bump;
            self.bump += size;
            self.live += 1;
            trace!(offset, size, "placed at tail");
            return Some(offset);
        }

        None
    }

    /// Return a placement's range to the arena.
    ///
    /// If the range is exactly the most recent tail allocation, the bump
    /// offset retracts; otherwise the range joins the free set.
    pub fn release(&mut self, offset: u64, size: u64) {
        debug_assert_eq!(offset % self.alignment, 0, "misaligned release offset");
        debug_assert!(offset + size <= self.bump, "release beyond bump offset");
        assert!(self.live > 0, "release on an empty arena");

        self.live -= 1;

        if offset + size == self.bump {
            // LIFO case: retract the tail instead of fragmenting.
            self.bump = offset;
            trace!(offset, size, "released tail, bump retracted");
        } else {
            self.insert_free(offset, size);
            self.free_bytes += size;
            trace!(offset, size, "released to free set");
        }
    }

    /// Can this arena host a request of `size` bytes right now?
    pub fn has_capacity_for(&self, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        self.size - self.bump >= size || self.free.range(size..).next().is_some()
    }

    /// Merge adjacent free ranges and fold tail-touching ranges back into
    /// the bump offset.
    ///
    /// Idempotent: running it twice in a row leaves the free set unchanged.
    /// Never merges ranges that do not touch.
    pub fn defragment(&mut self) {
        if self.free.is_empty() {
            return;
        }

        // Flatten to (offset, size) sorted by offset.
        let mut ranges: Vec<FreeRange> = self
            .free
            .iter()
            .flat_map(|(&size, offsets)| offsets.iter().map(move |&offset| FreeRange { offset, size }))
            .collect();
        ranges.sort_by_key(|r| r.offset);

        // Coalesce touching neighbors.
        let mut merged: Vec<FreeRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if last.offset + last.size == range.offset => {
                    last.size += range.size;
                }
                _ => merged.push(range),
            }
        }

        // A merged range ending at the bump offset becomes tail space again.
        if let Some(last) = merged.last() {
            if last.offset + last.size == self.bump {
                self.bump = last.offset;
                merged.pop();
            }
        }

        self.free.clear();
        self.free_bytes = 0;
        for range in merged {
            self.insert_free(range.offset, range.size);
            self.free_bytes += range.size;
        }
    }

    /// Snapshot current utilization.
    pub fn metrics(&self) -> ArenaMetrics {
        ArenaMetrics {
            size: self.size,
            bump_offset: self.bump,
            free_bytes: self.free_bytes,
            free_ranges: self.free.values().map(Vec::len).sum(),
            live_placements: self.live,
        }
    }

    /// All free ranges, sorted by offset. Test and diagnostics helper.
    pub fn free_ranges(&self) -> Vec<FreeRange> {
        let mut ranges: Vec<FreeRange> = self
            .free
            .iter()
            .flat_map(|(&size, offsets)| offsets.iter().map(move |&offset| FreeRange { offset, size }))
            .collect();
        ranges.sort_by_key(|r| r.offset);
        ranges
    }

    fn insert_free(&mut self, offset: u64, size: u64) {
        self.free.entry(size).or_default().push(offset);
    }

    /// Pop one offset for `size`, removing the bucket when it empties.
    fn pop_free(&mut self, size: u64) -> u64 {
        let offsets = self.free.get_mut(&size).expect("free bucket exists");
        let offset = offsets.pop().expect("free bucket non-empty");
        if offsets.is_empty() {
            self.free.remove(&size);
        }
        offset
    }
}
