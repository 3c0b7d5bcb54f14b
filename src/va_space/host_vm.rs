//! Host VM - OS-backed memory reached through ATS
//!
//! Addresses that no managed region owns may still be valid in the owning
//! process. The device then walks the host page tables directly, and the
//! engine populates pages through the host VM subsystem.

use crate::error::FaultError;
use crate::mask::PageMask;
use crate::types::{DeviceId, Residency};

/// NUMA-style placement policy of a host mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryPolicy {
    /// The single preferred residency, if the policy names exactly one
    pub preferred: Option<Residency>,
}

/// A host VMA `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub policy: MemoryPolicy,
}

impl OsMapping {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Per-page state of a granule as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeResidency {
    /// Pages with backing memory
    pub populated: PageMask,
    /// Pages resident on the faulting device
    pub on_device: PageMask,
    /// Pages the device can already write
    pub writable: PageMask,
}

/// One population call covering a granule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulateRequest {
    /// Granule base
    pub base: u64,
    pub device: DeviceId,
    pub read: PageMask,
    pub write: PageMask,
    pub prefetch: PageMask,
}

/// Pages the host actually made accessible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PopulateResult {
    pub read: PageMask,
    pub write: PageMask,
}

/// Host process VM
pub trait HostVm: Send + Sync {
    fn find_mapping(&self, addr: u64) -> Option<OsMapping>;

    /// Residency of the `valid` pages of the granule at `base`
    fn residency(&self, device: DeviceId, base: u64, valid: PageMask) -> RangeResidency;

    /// Populate, migrate and touch the requested pages
    fn populate_and_touch(
        &self,
        mapping: &OsMapping,
        request: &PopulateRequest,
    ) -> Result<PopulateResult, FaultError>;

    /// Invalidate device TLB entries for `[start, end)`
    fn tlb_invalidate(&self, device: DeviceId, start: u64, end: u64) -> Result<(), FaultError>;
}
