//! Batch Dispatcher
//!
//! Walks the service order one address-space run at a time. Each run takes
//! the region-set lock once and routes every record to a backing:
//!
//! - a managed block, serviced by the allocator
//! - an OS mapping, serviced through the host VM (ATS)
//! - nothing, in which case the record is fatal
//!
//! OS-backed servicing is refused within one granule of any managed region,
//! so a managed range can never be populated behind the allocator's back.

use alloc::sync::Arc;

use log::{debug, trace};

use crate::config::ReplayPolicy;
use crate::error::{FatalReason, Result};
use crate::fault::entry::{AccessKind, CancelVaMode, FaultStatus};
use crate::fault::preprocess::BatchStatus;
use crate::fault::servicer::FaultServicer;
use crate::fault::stats::FaultServiceStats;
use crate::hal::{FaultDevice, FlushMode, ReplayType};
use crate::types::{granule_base, AddressSpaceId, DeviceId, GRANULE_SIZE};
use crate::va_space::{
    HostVm, OsMapping, RegionAllocator, ServiceBlock, Translation, VaSpaceDirectory,
};

/// Why a batch is being dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Regular,
    /// Classification pass of the lockdown canceller; never replays
    Cancel,
}

/// Counters of one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Records serviced or already authorized
    pub serviced: u32,
    /// Pages handed to the allocator or host VM
    pub serviced_pages: u64,
    pub fatal: u32,
    /// Packets covered by another record
    pub duplicates: u32,
    pub throttled: u32,
    /// Prefetch packets to unserviceable addresses
    pub invalid_prefetch: u32,
    /// Records whose device left the address space
    pub stale: u32,
    /// Managed blocks serviced
    pub blocks: u32,
    /// OS-backed granules serviced
    pub ats_runs: u32,
}

/// Backing selected for a record
pub(crate) enum ServiceBacking {
    Managed(ServiceBlock),
    Os {
        mapping: OsMapping,
        vm: Arc<dyn HostVm>,
    },
    Invalid,
}

/// Pick the backing of `addr`
pub(crate) fn select_backing(
    regions: &dyn RegionAllocator,
    host_vm: Option<&Arc<dyn HostVm>>,
    addr: u64,
) -> ServiceBacking {
    if let Some(region) = regions.find_region(addr) {
        return ServiceBacking::Managed(region.block(addr));
    }
    let Some(vm) = host_vm else {
        return ServiceBacking::Invalid;
    };
    let start = addr.saturating_sub(GRANULE_SIZE);
    let end = addr.saturating_add(GRANULE_SIZE);
    if regions.managed_overlaps(start, end) {
        trace!("{:#x} is within a granule of a managed region", addr);
        return ServiceBacking::Invalid;
    }
    match vm.find_mapping(addr) {
        Some(mapping) if mapping.readable => ServiceBacking::Os {
            mapping,
            vm: Arc::clone(vm),
        },
        _ => ServiceBacking::Invalid,
    }
}

impl<D: FaultDevice, V: VaSpaceDirectory> FaultServicer<D, V> {
    /// Service every record of the current batch in service order
    pub(crate) fn dispatch(&mut self, mode: DispatchMode) -> Result<(BatchStatus, DispatchStats)> {
        let mut stats = DispatchStats::default();
        let outcome = self.dispatch_runs(mode, &mut stats);
        self.account(&stats);
        outcome.map(|status| (status, stats))
    }

    fn dispatch_runs(&mut self, mode: DispatchMode, stats: &mut DispatchStats) -> Result<BatchStatus> {
        let total = self.batch.ordered.len();
        let mut pos = 0;

        while pos < total {
            let index = self.batch.ordered[pos];
            let Some(translation) = self.batch.records[index].translation.clone() else {
                self.batch.records[index].status = FaultStatus::Stale;
                stats.stale += 1;
                pos += 1;
                continue;
            };
            let run_end = self.run_end(pos, translation.space_id(), translation.device);

            if translation.space.take_fault_buffer_flush() {
                debug!(
                    "address space {} requested a fault buffer flush",
                    translation.space_id().0
                );
                self.flush_buffer(FlushMode::UpdatePut, ReplayType::Start)?;
                return Ok(BatchStatus::Flushed);
            }

            self.dispatch_space(&translation, pos, run_end, mode, stats)?;
            pos = run_end;
        }

        Ok(BatchStatus::Ready)
    }

    /// End of the run of records sharing an address space and device
    fn run_end(&self, first: usize, space: AddressSpaceId, device: DeviceId) -> usize {
        let ordered = &self.batch.ordered;
        let mut end = first + 1;
        while end < ordered.len() {
            let record = &self.batch.records[ordered[end]];
            if record.space_id() != Some(space) || record.device() != Some(device) {
                break;
            }
            end += 1;
        }
        end
    }

    fn dispatch_space(
        &mut self,
        translation: &Translation,
        first: usize,
        run_end: usize,
        mode: DispatchMode,
        stats: &mut DispatchStats,
    ) -> Result<()> {
        let space = Arc::clone(&translation.space);
        let device = translation.device;

        if !space.is_registered(device) {
            for pos in first..run_end {
                let record = &mut self.batch.records[self.batch.ordered[pos]];
                if record.is_fatal {
                    stats.fatal += 1;
                } else {
                    record.status = FaultStatus::Stale;
                    stats.stale += 1;
                }
            }
            trace!(
                "device {} left address space {}, {} records stale",
                device.0,
                space.id().0,
                run_end - first
            );
            return Ok(());
        }

        self.ats.clear();
        let host_vm = space.host_vm().cloned();
        let serviced = {
            let mut regions = space.lock();
            self.service_run(&mut **regions, host_vm.as_ref(), device, first, run_end, mode, stats)
        };

        let invalidated = match host_vm {
            Some(vm) if !self.ats.is_empty() => self.ats.flush(&*vm, device, &self.stats).map(|_| ()),
            _ => Ok(()),
        };
        serviced.and(invalidated)
    }

    #[allow(clippy::too_many_arguments)]
    fn service_run(
        &mut self,
        regions: &mut dyn RegionAllocator,
        host_vm: Option<&Arc<dyn HostVm>>,
        device: DeviceId,
        first: usize,
        run_end: usize,
        mode: DispatchMode,
        stats: &mut DispatchStats,
    ) -> Result<()> {
        let mut pos = first;
        while pos < run_end {
            let index = self.batch.ordered[pos];
            let record = &self.batch.records[index];
            if record.is_fatal {
                stats.fatal += 1;
                pos += 1;
                continue;
            }

            match select_backing(regions, host_vm, record.address) {
                ServiceBacking::Managed(block) => {
                    pos += self.service_managed(regions, &block, device, pos, run_end, stats)?;
                    if self.batch.has_fatal {
                        regions.set_cancel(&block, device);
                    }
                    if mode == DispatchMode::Regular
                        && self.replay.policy() == ReplayPolicy::PerRegion
                    {
                        self.push_replay(ReplayType::Start)?;
                    }
                }
                ServiceBacking::Os { mapping, vm } => {
                    // Every record of the granule must clear the managed-range check
                    let base = granule_base(record.address);
                    let mut ats_end = pos + 1;
                    while ats_end < run_end {
                        let next = self.batch.records[self.batch.ordered[ats_end]].address;
                        if granule_base(next) != base
                            || !matches!(
                                select_backing(regions, host_vm, next),
                                ServiceBacking::Os { .. }
                            )
                        {
                            break;
                        }
                        ats_end += 1;
                    }
                    pos += self.service_ats_run(&vm, &mapping, device, pos, ats_end, stats)?;
                }
                ServiceBacking::Invalid => {
                    self.mark_unserviceable(index, stats);
                    pos += 1;
                }
            }
        }
        Ok(())
    }

    /// A record with no backing
    fn mark_unserviceable(&mut self, index: usize, stats: &mut DispatchStats) {
        let record = &self.batch.records[index];
        stats.duplicates += record.num_instances - 1;
        if record.access_kind == AccessKind::Prefetch {
            self.mark_invalid_prefetch(index, stats);
        } else {
            self.batch
                .mark_fatal(index, FatalReason::InvalidAddress, CancelVaMode::All);
            stats.fatal += 1;
        }
    }

    pub(crate) fn mark_invalid_prefetch(&mut self, index: usize, stats: &mut DispatchStats) {
        let record = &mut self.batch.records[index];
        if record.status != FaultStatus::InvalidPrefetch {
            stats.invalid_prefetch += record.num_instances;
        }
        record.is_invalid_prefetch = true;
        record.status = FaultStatus::InvalidPrefetch;
    }

    /// Fold a pass into the batch and servicer counters
    fn account(&mut self, stats: &DispatchStats) {
        self.batch.num_duplicates += stats.duplicates;
        self.batch.num_invalid_prefetch += stats.invalid_prefetch;

        let counters = &self.stats;
        FaultServiceStats::add(&counters.duplicates, stats.duplicates as u64);
        FaultServiceStats::add(&counters.invalid_prefetch, stats.invalid_prefetch as u64);
        FaultServiceStats::add(&counters.throttled, stats.throttled as u64);
        FaultServiceStats::add(&counters.fatal, stats.fatal as u64);
        FaultServiceStats::add(&counters.serviced_pages, stats.serviced_pages);
    }
}
