//! Allocator configuration and size-class defaults.
//!
//! The size-class table is injected at construction rather than compiled
//! in, so tests can run the allocator against tiny arenas and embedders can
//! tune tiers for their content.
//!
//! # Design Rationale
//!
//! Bucket tiers trade arena count against internal waste:
//! - Small tiers too large → few arenas, lots of slack per placement
//! - Small tiers too small → arena churn, more device calls
//!
//! The defaults follow typical game-engine content sizes:
//! - ≤512KiB: constant/vertex/index buffers, small textures
//! - ≤4MiB: 1024² BC-compressed textures, mid-size mesh data
//! - ≤32MiB: 2048²–4096² textures, large streamed meshes
//!
//! Anything above the last tier gets a dedicated arena sized to the
//! request (see the router).

/// One size-class tier: requests up to `threshold` bytes share arenas of
/// `granularity` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBucket {
    /// Largest request (after alignment rounding) this tier accepts.
    pub threshold: u64,
    /// Size of each arena created for this tier.
    pub granularity: u64,
}

/// Configuration injected into the allocator at construction.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Size-class tiers, ordered by ascending threshold.
    pub buckets: Vec<SizeBucket>,
    /// Hardware placement alignment quantum. Every placement offset and
    /// rounded size is a multiple of this. Must be a power of two.
    pub placement_alignment: u64,
    /// Hard cap on a single resource; larger requests are rejected with
    /// [`Error::ResourceTooLarge`](crate::error::Error::ResourceTooLarge).
    pub max_resource_size: u64,
    /// Page size for the per-frame bump pool.
    pub frame_page_size: u64,
    /// Page size for the legacy paged allocator.
    pub paged_page_size: u64,
}

/// Default placement alignment (hardware placement requirement).
pub const DEFAULT_PLACEMENT_ALIGNMENT: u64 = 256;

/// Default frame-pool page size (64 KiB of host-visible constants).
pub const DEFAULT_FRAME_PAGE_SIZE: u64 = 64 * 1024;

/// Default legacy-allocator page size.
pub const DEFAULT_PAGED_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Default single-resource cap (1 GiB).
pub const DEFAULT_MAX_RESOURCE_SIZE: u64 = 1024 * 1024 * 1024;

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            buckets: vec![
                SizeBucket {
                    threshold: 512 * 1024,
                    granularity: 4 * 1024 * 1024,
                },
                SizeBucket {
                    threshold: 4 * 1024 * 1024,
                    granularity: 16 * 1024 * 1024,
                },
                SizeBucket {
                    threshold: 32 * 1024 * 1024,
                    granularity: 64 * 1024 * 1024,
                },
            ],
            placement_alignment: DEFAULT_PLACEMENT_ALIGNMENT,
            max_resource_size: DEFAULT_MAX_RESOURCE_SIZE,
            frame_page_size: DEFAULT_FRAME_PAGE_SIZE,
            paged_page_size: DEFAULT_PAGED_PAGE_SIZE,
        }
    }
}

impl AllocatorConfig {
    /// Validate the configuration.
    ///
    /// # Panics
    ///
    /// Panics on a malformed table (unordered tiers, granularity below
    /// threshold, non-power-of-two alignment). Configuration is assembled
    /// at startup, so this is a fail-fast check rather than an error path.
    pub fn validate(&self) {
        assert!(
            self.placement_alignment.is_power_of_two(),
            "placement alignment must be a power of two"
        );
        assert!(!self.buckets.is_empty(), "at least one size bucket required");

        let mut prev = 0;
        for bucket in &self.buckets {
            assert!(
                bucket.threshold > prev,
                "bucket thresholds must be strictly ascending"
            );
            assert!(
                bucket.granularity >= bucket.threshold,
                "bucket granularity must cover its threshold"
            );
            assert!(
                bucket.granularity % self.placement_alignment == 0,
                "bucket granularity must be alignment-quantized"
            );
            prev = bucket.threshold;
        }

        assert!(
            self.frame_page_size % self.placement_alignment == 0,
            "frame page size must be alignment-quantized"
        );
        assert!(
            self.paged_page_size % self.placement_alignment == 0,
            "paged page size must be alignment-quantized"
        );
    }

    /// Index of the tier accepting `size`, or `None` for oversize requests
    /// (which get dedicated arenas).
    pub fn bucket_for(&self, size: u64) -> Option<usize> {
        self.buckets.iter().position(|b| size <= b.threshold)
    }
}

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
