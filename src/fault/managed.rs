//! Managed-Region Servicer
//!
//! Services every record of one managed block with a single allocator call.
//!
//! ## Planning
//!
//! Records arrive in service order, so all records of a page are adjacent
//! and the first carries the most intrusive access. For each record:
//!
//! 1. A repeat of a non-fatal page inherits that page's outcome
//! 2. The allocator checks the access. A failed write may still be serviced
//!    for read when the record also saw reads; the record is then cancelled
//!    for writes and atomics only
//! 3. Pages the device can already access need nothing
//! 4. The thrashing heuristic may throttle or pin the page
//! 5. The allocator picks the residency and the page joins the plan
//!
//! ## Retry
//!
//! `apply_service` may ask for a retry when the block changed underneath
//! (eviction, concurrent migration). The block is planned again from the
//! same records; counters are only updated on the first pass.

use log::trace;

use alloc::vec::Vec;

use crate::error::{FaultError, Result};
use crate::fault::entry::{AccessKind, AccessKindMask, CancelVaMode, FaultStatus};
use crate::fault::service::DispatchStats;
use crate::fault::servicer::FaultServicer;
use crate::hal::FaultDevice;
use crate::types::{page_index, DeviceId};
use crate::va_space::{RegionAllocator, ServiceBlock, ServicePlan, ThrashingHint, VaSpaceDirectory};

impl<D: FaultDevice, V: VaSpaceDirectory> FaultServicer<D, V> {
    /// Service the records at `ordered[first..]` that fall inside `block`.
    /// Returns the number of records consumed.
    pub(crate) fn service_managed(
        &mut self,
        regions: &mut dyn RegionAllocator,
        block: &ServiceBlock,
        device: DeviceId,
        first: usize,
        run_end: usize,
        stats: &mut DispatchStats,
    ) -> Result<usize> {
        let mut end = first;
        while end < run_end {
            let record = &self.batch.records[self.batch.ordered[end]];
            if !block.contains(record.address) {
                break;
            }
            end += 1;
        }

        let mut first_try = true;
        loop {
            let (plan, planned) =
                self.plan_block(regions, block, device, first, end, first_try, stats);
            if plan.is_empty() {
                break;
            }

            match regions.apply_service(block, &plan) {
                Ok(completion) => {
                    if let Some(completion) = completion {
                        self.batch.tracker.add(completion);
                    }
                    for index in planned {
                        self.batch.records[index].status = FaultStatus::Serviced;
                        stats.serviced += 1;
                    }
                    stats.serviced_pages += plan.page_count() as u64;
                    stats.blocks += 1;
                    break;
                }
                Err(FaultError::RetryService) => {
                    trace!("block {:#x}..{:#x} changed, retrying", block.start, block.end);
                    first_try = false;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(end - first)
    }

    /// Build the plan for `ordered[first..end]`. Returns the plan and the
    /// records it services.
    #[allow(clippy::too_many_arguments)]
    fn plan_block(
        &mut self,
        regions: &mut dyn RegionAllocator,
        block: &ServiceBlock,
        device: DeviceId,
        first: usize,
        end: usize,
        first_try: bool,
        stats: &mut DispatchStats,
    ) -> (ServicePlan, Vec<usize>) {
        let region = block.region;
        let thrashing = self.thrashing.clone();
        let mut plan = ServicePlan::new(device);
        let mut planned = Vec::new();
        let mut previous: Option<usize> = None;

        for pos in first..end {
            let index = self.batch.ordered[pos];
            let prev = previous.replace(index);
            let record = &self.batch.records[index];
            let address = record.address;
            let kind = record.access_kind;

            // Decoder-fatal: nothing the allocator can do
            if record.is_fatal && record.fault_type.is_fatal() {
                if first_try {
                    stats.fatal += 1;
                }
                continue;
            }

            if let Some(prev) = prev.filter(|p| {
                let p = &self.batch.records[*p];
                p.address == address && !p.is_fatal
            }) {
                let (throttled, invalid_prefetch) = {
                    let p = &self.batch.records[prev];
                    (p.is_throttled, p.is_invalid_prefetch)
                };
                let record = &mut self.batch.records[index];
                record.is_throttled = throttled;
                record.is_invalid_prefetch = invalid_prefetch;
                record.status = if throttled {
                    FaultStatus::Throttled
                } else if invalid_prefetch {
                    FaultStatus::InvalidPrefetch
                } else {
                    FaultStatus::Duplicate
                };
                if first_try {
                    stats.duplicates += record.num_instances;
                }
                continue;
            }
            if first_try {
                stats.duplicates += record.num_instances - 1;
            }

            let mut service_kind = kind;
            let mut kinds = record.access_mask;
            if let Err(reason) = regions.check_permission(&region, address, kind) {
                if kind == AccessKind::Prefetch {
                    self.mark_invalid_prefetch(index, stats);
                    continue;
                }

                let mut mode = if kind > AccessKind::Read {
                    CancelVaMode::WriteAndAtomic
                } else {
                    CancelVaMode::All
                };
                let mut read_ok = false;
                if kind > AccessKind::Read && record.access_mask.has(AccessKind::Read) {
                    match regions.check_permission(&region, address, AccessKind::Read) {
                        Ok(()) => read_ok = true,
                        Err(_) => mode = CancelVaMode::All,
                    }
                }

                self.batch.mark_fatal(index, reason, mode);
                if first_try {
                    stats.fatal += 1;
                }
                if !read_ok {
                    continue;
                }
                service_kind = AccessKind::Read;
                kinds = AccessKindMask::READ;
            }

            let is_fatal = self.batch.records[index].is_fatal;
            if regions.is_authorized(&region, device, address, service_kind) {
                if !is_fatal {
                    self.batch.records[index].status = FaultStatus::Serviced;
                    if first_try {
                        stats.serviced += 1;
                    }
                }
                continue;
            }

            let hint = thrashing
                .as_ref()
                .map(|t| t.hint(&region, address, device))
                .unwrap_or_default();
            match hint {
                ThrashingHint::Throttle => {
                    let record = &mut self.batch.records[index];
                    record.is_throttled = true;
                    if !is_fatal {
                        record.status = FaultStatus::Throttled;
                    }
                    self.batch.has_throttled = true;
                    if first_try {
                        stats.throttled += 1;
                    }
                    continue;
                }
                ThrashingHint::Pin => plan.pinned.set(page_index(address)),
                ThrashingHint::Proceed => {}
            }

            let decision = regions.select_residency(&region, device, address, kinds, hint);
            plan.add(decision, page_index(address), service_kind);
            if !is_fatal {
                planned.push(index);
            }
        }

        (plan, planned)
    }
}
