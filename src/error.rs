//! Error types for Quarry.
//!
//! Allocation-time failures (a request that is too large, a device that ran
//! out of memory) are recoverable and surface as [`Error`] values. Lifetime
//! bugs in calling code (stale handles, double release) and internal
//! invariant violations (misaligned offsets) are *not* errors: they fail
//! fast with a panic or debug assertion at the call site.

use thiserror::Error;

/// Result type alias using Quarry's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Quarry operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Requested size exceeds the configured maximum resource size.
    ///
    /// The caller may free transient resources and retry with a smaller
    /// request, or raise the limit in [`AllocatorConfig`].
    ///
    /// [`AllocatorConfig`]: crate::memory::AllocatorConfig
    #[error("resource too large: {size} bytes exceeds maximum of {max}")]
    ResourceTooLarge {
        /// Requested size in bytes (after alignment rounding).
        size: u64,
        /// Configured maximum resource size in bytes.
        max: u64,
    },

    /// The external device failed to create a memory region or place a
    /// resource (typically out of device memory). Not retried internally.
    #[error("device allocation failed: {0}")]
    DeviceAllocationFailed(String),

    /// The resource descriptor is malformed (zero size, etc.).
    #[error("invalid resource descriptor: {0}")]
    InvalidDescriptor(String),

    /// A host-visible mapping was requested for a region that is not
    /// CPU-accessible.
    #[error("region is not host-visible")]
    NotHostVisible,
}
