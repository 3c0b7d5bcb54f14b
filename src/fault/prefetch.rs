//! Prefetch Heuristic
//!
//! Proposes pages to migrate along with the faulted ones, never leaving the
//! granule of the fault.
//!
//! ## Bulk First Touch
//!
//! When the mapping prefers exactly the faulting device and nothing in the
//! granule has been populated yet, the whole granule is proposed.
//!
//! ## Bitmap Tree
//!
//! Otherwise the granule is viewed as a binary tree of aligned power-of-two
//! subregions. For each accessed page the largest subregion whose occupancy
//! (accessed or already on the device) exceeds the threshold is proposed.

use crate::mask::PageMask;
use crate::types::{DeviceId, Residency, PAGES_PER_GRANULE};
use crate::va_space::{MemoryPolicy, RangeResidency};

/// Pages to prefetch, excluding the accessed ones
pub fn propose(
    accessed: &PageMask,
    residency: &RangeResidency,
    valid: &PageMask,
    policy: &MemoryPolicy,
    device: DeviceId,
    threshold: u32,
) -> PageMask {
    if accessed.is_empty() {
        return PageMask::new();
    }

    if policy.preferred == Some(Residency::Device(device)) && residency.populated.is_empty() {
        return valid.and_not(accessed);
    }

    let occupied = (*accessed | residency.on_device) & *valid;
    let mut proposal = PageMask::new();
    for page in accessed.iter() {
        if let Some((first, end)) = largest_dense_subregion(page, &occupied, valid, threshold) {
            proposal.set_range(first, end);
        }
    }
    proposal & *valid & !*accessed
}

/// Largest aligned subregion around `page` above the occupancy threshold
fn largest_dense_subregion(
    page: usize,
    occupied: &PageMask,
    valid: &PageMask,
    threshold: u32,
) -> Option<(usize, usize)> {
    let mut best = None;
    let mut size = 2;
    while size <= PAGES_PER_GRANULE {
        let first = page & !(size - 1);
        let end = first + size;
        let pages = valid.count_range(first, end);
        let dense = occupied.count_range(first, end);
        if pages > 0 && dense * 100 > threshold as usize * pages {
            best = Some((first, end));
        }
        size <<= 1;
    }
    best
}
