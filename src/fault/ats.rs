//! OS-backed (ATS) Servicing
//!
//! Faults on addresses no managed region owns are serviced through the host
//! process VM. The device walks host page tables through ATS, so servicing
//! means populating the pages on the host side and invalidating device TLB
//! entries that may cache a weaker permission.
//!
//! ## One Call Per Granule
//!
//! Records of one granule and mapping are folded into read and write masks,
//! extended by the prefetch heuristic and handed to the host VM in a single
//! call. If the host did not satisfy every requested page the records are
//! classified one by one against what was actually serviced.
//!
//! ## Invalidations
//!
//! Pages that became writable are queued and invalidated once per address
//! space run, before the next address space is serviced.

use alloc::sync::Arc;

use log::{debug, trace};

use crate::error::{FatalReason, Result};
use crate::fault::entry::{AccessKind, AccessKindMask, CancelVaMode, FaultStatus};
use crate::fault::prefetch;
use crate::fault::service::DispatchStats;
use crate::fault::servicer::FaultServicer;
use crate::fault::stats::FaultServiceStats;
use crate::hal::FaultDevice;
use crate::mask::PageMask;
use crate::types::{granule_base, page_address, page_index, DeviceId, GRANULE_SIZE, PAGE_SHIFT};
use crate::va_space::{HostVm, OsMapping, PopulateRequest, VaSpaceDirectory};

/// Pending ranges before the queue collapses into one covering range
const MAX_PENDING_INVALIDATIONS: usize = 16;

// ============================================================================
// TLB Invalidation Queue
// ============================================================================

/// Device TLB ranges waiting for invalidation
#[derive(Debug, Default)]
pub struct AtsInvalidator {
    ranges: heapless::Vec<(u64, u64), MAX_PENDING_INVALIDATIONS>,
}

impl AtsInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// Queue `[start, end)`, merging with the previous range when adjacent
    pub fn push(&mut self, start: u64, end: u64) {
        if let Some(last) = self.ranges.last_mut() {
            if last.1 == start {
                last.1 = end;
                return;
            }
        }
        if let Err(range) = self.ranges.push((start, end)) {
            // Out of slots: over-invalidate with a single range
            let first = self.ranges.iter().map(|r| r.0).fold(range.0, u64::min);
            let last = self.ranges.iter().map(|r| r.1).fold(range.1, u64::max);
            self.ranges.clear();
            let _ = self.ranges.push((first, last));
        }
    }

    /// Invalidate every queued range on `device`
    pub fn flush(
        &mut self,
        vm: &dyn HostVm,
        device: DeviceId,
        stats: &FaultServiceStats,
    ) -> Result<usize> {
        let count = self.ranges.len();
        for (start, end) in self.ranges.iter() {
            vm.tlb_invalidate(device, *start, *end)?;
            stats.incr_ats_invalidations();
        }
        self.ranges.clear();
        if count > 0 {
            debug!("{} ATS invalidations on device {}", count, device.0);
        }
        Ok(count)
    }
}

// ============================================================================
// Granule Servicing
// ============================================================================

/// Pages requested for one granule of an OS mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtsRequest {
    /// Granule base
    pub base: u64,
    pub device: DeviceId,
    pub read: PageMask,
    pub write: PageMask,
}

/// What the host made accessible for one granule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtsOutcome {
    pub serviced_read: PageMask,
    pub serviced_write: PageMask,
    /// Writes to a read-only mapping with no read on the same page
    pub rejected_write: PageMask,
    /// Every requested page was satisfied
    pub precise: bool,
}

/// Pages of the granule at `base` covered by `mapping`
pub fn mapping_pages(mapping: &OsMapping, base: u64) -> PageMask {
    let start = mapping.start.max(base);
    let end = mapping.end.min(base + GRANULE_SIZE);
    if start >= end {
        return PageMask::new();
    }
    let first = ((start - base) >> PAGE_SHIFT) as usize;
    let last = ((end - base - 1) >> PAGE_SHIFT) as usize;
    PageMask::range(first, last + 1)
}

/// Service one granule of an OS mapping
///
/// `prefetch_threshold` enables the prefetch heuristic.
pub fn service_os(
    vm: &dyn HostVm,
    mapping: &OsMapping,
    request: &AtsRequest,
    prefetch_threshold: Option<u32>,
    invalidator: &mut AtsInvalidator,
) -> Result<AtsOutcome> {
    let valid = mapping_pages(mapping, request.base);
    let read = request.read & valid;
    let mut write = request.write & valid;

    let mut rejected_write = PageMask::new();
    if !mapping.writable {
        rejected_write = write.and_not(&read);
        write &= read;
    }

    if read.is_empty() && write.is_empty() {
        return Ok(AtsOutcome {
            rejected_write,
            ..Default::default()
        });
    }

    let before = vm.residency(request.device, request.base, valid);
    let prefetch = match prefetch_threshold {
        Some(threshold) => prefetch::propose(
            &(read | write),
            &before,
            &valid,
            &mapping.policy,
            request.device,
            threshold,
        )
        .and_not(&before.on_device),
        None => PageMask::new(),
    };

    let result = vm.populate_and_touch(
        mapping,
        &PopulateRequest {
            base: request.base,
            device: request.device,
            read,
            write,
            prefetch,
        },
    )?;

    let newly_writable = result.write.and_not(&before.writable);
    for (first, end) in newly_writable.runs() {
        invalidator.push(
            page_address(request.base, first),
            page_address(request.base, end),
        );
    }

    let precise = rejected_write.is_empty()
        && read.and_not(&(result.read | result.write)).is_empty()
        && write.and_not(&result.write).is_empty();
    trace!(
        "ATS granule {:#x}: read {} write {} prefetch {} precise {}",
        request.base,
        read.count(),
        write.count(),
        prefetch.count(),
        precise
    );

    Ok(AtsOutcome {
        serviced_read: result.read,
        serviced_write: result.write,
        rejected_write,
        precise,
    })
}

impl<D: FaultDevice, V: VaSpaceDirectory> FaultServicer<D, V> {
    /// Service the records at `ordered[first..]` in the same granule and
    /// mapping. Returns the number of records consumed.
    pub(crate) fn service_ats_run(
        &mut self,
        vm: &Arc<dyn HostVm>,
        mapping: &OsMapping,
        device: DeviceId,
        first: usize,
        run_end: usize,
        stats: &mut DispatchStats,
    ) -> Result<usize> {
        let base = granule_base(self.batch.records[self.batch.ordered[first]].address);
        let mut read = PageMask::new();
        let mut write = PageMask::new();

        let mut end = first;
        while end < run_end {
            let record = &self.batch.records[self.batch.ordered[end]];
            if granule_base(record.address) != base || !mapping.contains(record.address) {
                break;
            }
            if !record.is_fatal {
                let page = page_index(record.address);
                let writes = record.access_kind.needs_write();
                if writes {
                    write.set(page);
                }
                if !writes
                    || record
                        .access_mask
                        .intersects(AccessKindMask::READ | AccessKindMask::PREFETCH)
                {
                    read.set(page);
                }
            }
            end += 1;
        }

        let request = AtsRequest {
            base,
            device,
            read,
            write,
        };
        let threshold = self
            .config
            .ats_prefetch
            .then_some(self.config.prefetch_threshold);
        let outcome = service_os(&**vm, mapping, &request, threshold, &mut self.ats)?;
        stats.ats_runs += 1;
        stats.serviced_pages += (outcome.serviced_read | outcome.serviced_write).count() as u64;

        for pos in first..end {
            let index = self.batch.ordered[pos];
            self.classify_ats(index, mapping, &outcome, stats);
        }
        Ok(end - first)
    }

    fn classify_ats(
        &mut self,
        index: usize,
        mapping: &OsMapping,
        outcome: &AtsOutcome,
        stats: &mut DispatchStats,
    ) {
        let record = &mut self.batch.records[index];
        if record.is_fatal {
            stats.fatal += 1;
            return;
        }
        stats.duplicates += record.num_instances - 1;

        let page = page_index(record.address);
        let write_ok = outcome.serviced_write.test(page) && !outcome.rejected_write.test(page);
        let read_ok = outcome.serviced_read.test(page) || outcome.serviced_write.test(page);

        if record.access_kind.needs_write() {
            if outcome.precise || write_ok {
                record.status = FaultStatus::Serviced;
                stats.serviced += 1;
                return;
            }
            let reason = if mapping.writable {
                FatalReason::InvalidAddress
            } else {
                FatalReason::InvalidPermissions
            };
            let mode = if read_ok {
                CancelVaMode::WriteAndAtomic
            } else {
                CancelVaMode::All
            };
            self.batch.mark_fatal(index, reason, mode);
            stats.fatal += 1;
        } else if outcome.precise || read_ok {
            record.status = FaultStatus::Serviced;
            stats.serviced += 1;
        } else if record.access_kind == AccessKind::Prefetch {
            self.mark_invalid_prefetch(index, stats);
        } else {
            self.batch
                .mark_fatal(index, FatalReason::InvalidAddress, CancelVaMode::All);
            stats.fatal += 1;
        }
    }
}
