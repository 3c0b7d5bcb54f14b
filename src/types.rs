//! Common types used across the fault engine
//!
//! Identifiers, page geometry and residency. Kept here to avoid circular
//! dependencies between the fault pipeline and the address-space layer.

// ============================================================================
// Page Geometry
// ============================================================================

/// Log2 of the fault-servicing page size
pub const PAGE_SHIFT: u32 = 12;

/// Fault-servicing page size (4 KiB)
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Log2 of the alignment granule
pub const GRANULE_SHIFT: u32 = 21;

/// Alignment granule (2 MiB). Managed blocks never straddle it, and OS-backed
/// servicing is disabled within one granule of a managed region.
pub const GRANULE_SIZE: u64 = 1 << GRANULE_SHIFT;

/// Pages covered by one granule
pub const PAGES_PER_GRANULE: usize = (GRANULE_SIZE / PAGE_SIZE) as usize;

/// Align an address down to its page
#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Base address of the granule containing `addr`
#[inline]
pub const fn granule_base(addr: u64) -> u64 {
    addr & !(GRANULE_SIZE - 1)
}

/// Index of the page containing `addr` within its granule
#[inline]
pub const fn page_index(addr: u64) -> usize {
    ((addr & (GRANULE_SIZE - 1)) >> PAGE_SHIFT) as usize
}

/// Address of page `index` within the granule starting at `base`
#[inline]
pub const fn page_address(base: u64, index: usize) -> u64 {
    base + ((index as u64) << PAGE_SHIFT)
}

// ============================================================================
// Identifiers
// ============================================================================

/// Physical GPU identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(pub u32);

/// Address space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AddressSpaceId(pub u64);

/// Managed region identifier, assigned by the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RegionId(pub u64);

/// Micro-TLB identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UtlbId(pub u16);

impl UtlbId {
    /// Index into per-uTLB arenas
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Owning context of a fault
///
/// The hardware reports the instance block pointer of the faulting channel
/// plus the subcontext (VEID) within it. Neither is meaningful to the engine
/// until translated by a [`crate::va_space::VaSpaceDirectory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContextHandle {
    /// Instance block pointer (page aligned)
    pub instance: u64,
    /// Subcontext within the instance
    pub subcontext: u8,
}

impl ContextHandle {
    pub const fn new(instance: u64, subcontext: u8) -> Self {
        Self {
            instance,
            subcontext,
        }
    }
}

// ============================================================================
// Residency
// ============================================================================

/// Physical memory pool that holds, or should hold, a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Residency {
    /// System memory
    Host,
    /// Device-local memory of the given GPU
    Device(DeviceId),
}

impl Residency {
    pub fn is_device(&self, device: DeviceId) -> bool {
        *self == Residency::Device(device)
    }
}
