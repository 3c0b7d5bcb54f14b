//! Managed regions and the allocator interface
//!
//! A managed region is an allocator-owned VA range with an explicit
//! residency map. The engine services it one *block* at a time, a block
//! being the region clipped to one alignment granule.

use alloc::vec::Vec;

use crate::error::{FatalReason, FaultError};
use crate::fault::entry::{AccessKind, AccessKindMask};
use crate::hal::Completion;
use crate::mask::PageMask;
use crate::types::{granule_base, page_index, DeviceId, RegionId, Residency, GRANULE_SIZE};

// ============================================================================
// Regions and Blocks
// ============================================================================

/// An allocator-owned VA range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedRegion {
    pub id: RegionId,
    pub start: u64,
    pub end: u64,
}

impl ManagedRegion {
    pub fn new(id: RegionId, start: u64, end: u64) -> Self {
        Self { id, start, end }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// The block of this region containing `addr`
    pub fn block(&self, addr: u64) -> ServiceBlock {
        let base = granule_base(addr);
        ServiceBlock {
            region: *self,
            start: self.start.max(base),
            end: self.end.min(base + GRANULE_SIZE),
        }
    }
}

/// Part of a managed region within one granule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceBlock {
    pub region: ManagedRegion,
    pub start: u64,
    pub end: u64,
}

impl ServiceBlock {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn granule_base(&self) -> u64 {
        granule_base(self.start)
    }

    /// Pages of the granule covered by this block
    pub fn valid_pages(&self) -> PageMask {
        let first = page_index(self.start);
        let last = page_index(self.end - 1);
        PageMask::range(first, last + 1)
    }
}

// ============================================================================
// Service Plan
// ============================================================================

/// Outcome of residency selection for one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidencyDecision {
    pub residency: Residency,
    /// Map a read-only copy instead of migrating
    pub read_duplicate: bool,
}

impl ResidencyDecision {
    pub fn on(residency: Residency) -> Self {
        Self {
            residency,
            read_duplicate: false,
        }
    }
}

/// What one `apply_service` call must do for a block
///
/// Pages are grouped per target residency so the allocator issues one
/// migration per residency for the whole block.
#[derive(Debug, Clone)]
pub struct ServicePlan {
    /// Faulting device
    pub device: DeviceId,
    /// Pages to make resident, per target residency
    pub targets: Vec<(Residency, PageMask)>,
    /// Pages to read-duplicate
    pub read_duplicate: PageMask,
    /// Pages the thrashing heuristic asked to pin
    pub pinned: PageMask,
    /// Access each page must be mapped with, indexed by page in the granule
    pub access: Vec<(usize, AccessKind)>,
}

impl ServicePlan {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            targets: Vec::new(),
            read_duplicate: PageMask::new(),
            pinned: PageMask::new(),
            access: Vec::new(),
        }
    }

    /// Add `page` to the plan. A page already planned keeps the strongest
    /// access requested for it.
    pub fn add(&mut self, decision: ResidencyDecision, page: usize, kind: AccessKind) {
        match self.targets.iter_mut().find(|(r, _)| *r == decision.residency) {
            Some((_, mask)) => mask.set(page),
            None => {
                let mut mask = PageMask::new();
                mask.set(page);
                self.targets.push((decision.residency, mask));
            }
        }
        if decision.read_duplicate {
            self.read_duplicate.set(page);
        }
        match self.access.iter_mut().find(|(p, _)| *p == page) {
            Some((_, existing)) => {
                if kind > *existing {
                    *existing = kind;
                }
            }
            None => self.access.push((page, kind)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access.is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.access.len()
    }

    /// Pages targeted at `residency`
    pub fn mask_for(&self, residency: Residency) -> PageMask {
        self.targets
            .iter()
            .find(|(r, _)| *r == residency)
            .map(|(_, m)| *m)
            .unwrap_or_default()
    }

    /// Access a page is mapped with
    pub fn access_for(&self, page: usize) -> Option<AccessKind> {
        self.access.iter().find(|(p, _)| *p == page).map(|(_, k)| *k)
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Thrashing heuristic verdict for one page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrashingHint {
    #[default]
    Proceed,
    /// Skip the page this round
    Throttle,
    /// Map in place instead of migrating
    Pin,
}

/// Residency thrashing detection
pub trait ThrashingHeuristic: Send + Sync {
    fn hint(&self, region: &ManagedRegion, addr: u64, device: DeviceId) -> ThrashingHint;
}

/// The VA allocator's region set for one address space
///
/// Called with the address space lock held.
pub trait RegionAllocator: Send {
    /// Managed region covering `addr`
    fn find_region(&self, addr: u64) -> Option<ManagedRegion>;

    /// Whether any managed region intersects `[start, end)`
    fn managed_overlaps(&self, start: u64, end: u64) -> bool;

    /// Check that `kind` is allowed on the page
    fn check_permission(
        &self,
        region: &ManagedRegion,
        addr: u64,
        kind: AccessKind,
    ) -> Result<(), FatalReason>;

    /// Whether `device` already has a mapping good for `kind`
    fn is_authorized(
        &self,
        region: &ManagedRegion,
        device: DeviceId,
        addr: u64,
        kind: AccessKind,
    ) -> bool;

    /// Pick where the page should live
    fn select_residency(
        &mut self,
        region: &ManagedRegion,
        device: DeviceId,
        addr: u64,
        kinds: AccessKindMask,
        hint: ThrashingHint,
    ) -> ResidencyDecision;

    /// Migrate and map the planned pages
    ///
    /// May return [`FaultError::RetryService`] if the block state changed
    /// underneath, in which case the block is re-planned.
    fn apply_service(
        &mut self,
        block: &ServiceBlock,
        plan: &ServicePlan,
    ) -> Result<Option<Completion>, FaultError>;

    /// Mark the block as having faults about to be cancelled
    fn set_cancel(&mut self, block: &ServiceBlock, device: DeviceId);
}
