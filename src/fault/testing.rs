//! Unit-test doubles: an idle device and a fixed directory

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::config::FaultConfig;
use crate::error::{FatalReason, FaultError, LookupError, Result};
use crate::fault::batch::Batch;
use crate::fault::entry::{AccessKind, AccessKindMask, CancelVaMode, FaultPacket, FaultSource, FaultType};
use crate::fault::preprocess::{order_by_context, order_for_service};
use crate::fault::servicer::FaultServicer;
use crate::hal::{
    Completion, DeviceCaps, FaultBufferHal, FaultDevice, HostHal, ReplayType, FAULT_PACKET_SIZE,
};
use crate::types::{AddressSpaceId, ContextHandle, DeviceId, Residency, UtlbId};
use crate::va_space::{
    AddressSpace, ManagedRegion, RegionAllocator, ResidencyDecision, ServiceBlock, ServicePlan,
    ThrashingHint, Translation, VaSpaceDirectory,
};

pub(crate) const DEV: DeviceId = DeviceId(0);

pub(crate) type TestServicer = FaultServicer<IdleDevice, FixedDirectory>;

/// Host method pushed to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Replay(ReplayType),
    Targeted(ContextHandle, UtlbId),
    Precise(AddressSpaceId, u64, CancelVaMode),
    Global(ContextHandle),
}

/// Device with an always-empty buffer that logs host methods
pub(crate) struct IdleDevice {
    pub caps: DeviceCaps,
    pub ops: Mutex<Vec<Op>>,
    next: AtomicU64,
}

impl IdleDevice {
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            ops: Mutex::new(Vec::new()),
            next: AtomicU64::new(1),
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    fn log(&self, op: Op) -> Result<Completion> {
        self.ops.lock().push(op);
        Ok(Completion(self.next.fetch_add(1, Ordering::Relaxed)))
    }
}

impl FaultBufferHal for IdleDevice {
    fn max_faults(&self) -> u32 {
        32
    }

    fn read_get(&self) -> u32 {
        0
    }

    fn read_put(&self) -> u32 {
        0
    }

    fn write_get(&self, _get: u32) {}

    fn entry_is_valid(&self, _index: u32) -> bool {
        false
    }

    fn entry_clear_valid(&self, _index: u32) {}

    fn read_entry(&self, _index: u32, _packet: &mut [u8; FAULT_PACKET_SIZE]) {}

    fn enable_prefetch_faults(&self) {}

    fn disable_prefetch_faults(&self) {}
}

impl HostHal for IdleDevice {
    fn replay(&self, kind: ReplayType) -> Result<Completion> {
        self.log(Op::Replay(kind))
    }

    fn cancel_targeted(&self, context: ContextHandle, source: FaultSource) -> Result<Completion> {
        self.log(Op::Targeted(context, source.utlb))
    }

    fn cancel_precise(
        &self,
        space: AddressSpaceId,
        address: u64,
        mode: CancelVaMode,
    ) -> Result<Completion> {
        self.log(Op::Precise(space, address, mode))
    }

    fn cancel_global(&self, context: ContextHandle) -> Result<Completion> {
        self.log(Op::Global(context))
    }

    fn wait(&self, _completion: Completion) -> Result<()> {
        Ok(())
    }

    fn now_ns(&self) -> u64 {
        0
    }
}

impl FaultDevice for IdleDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }
}

/// Allocator that owns nothing
pub(crate) struct NoRegions;

impl RegionAllocator for NoRegions {
    fn find_region(&self, _addr: u64) -> Option<ManagedRegion> {
        None
    }

    fn managed_overlaps(&self, _start: u64, _end: u64) -> bool {
        false
    }

    fn check_permission(
        &self,
        _region: &ManagedRegion,
        _addr: u64,
        _kind: AccessKind,
    ) -> core::result::Result<(), FatalReason> {
        Ok(())
    }

    fn is_authorized(&self, _: &ManagedRegion, _: DeviceId, _: u64, _: AccessKind) -> bool {
        false
    }

    fn select_residency(
        &mut self,
        _region: &ManagedRegion,
        device: DeviceId,
        _addr: u64,
        _kinds: AccessKindMask,
        _hint: ThrashingHint,
    ) -> ResidencyDecision {
        ResidencyDecision::on(Residency::Device(device))
    }

    fn apply_service(
        &mut self,
        _block: &ServiceBlock,
        _plan: &ServicePlan,
    ) -> core::result::Result<Option<Completion>, FaultError> {
        Ok(None)
    }

    fn set_cancel(&mut self, _block: &ServiceBlock, _device: DeviceId) {}
}

/// Directory resolving instance pointers to fixed address spaces
#[derive(Default)]
pub(crate) struct FixedDirectory {
    pub spaces: Vec<(u64, Translation)>,
}

impl VaSpaceDirectory for FixedDirectory {
    fn lookup(&self, context: ContextHandle) -> core::result::Result<Translation, LookupError> {
        self.spaces
            .iter()
            .find(|(instance, _)| *instance == context.instance)
            .map(|(_, t)| t.clone())
            .ok_or(LookupError::ChannelGone)
    }
}

/// A registered address space with no regions
pub(crate) fn space(id: u64) -> Translation {
    let space = Arc::new(AddressSpace::new(AddressSpaceId(id), Box::new(NoRegions)));
    space.register_device(DEV);
    Translation { space, device: DEV }
}

pub(crate) fn servicer(caps: DeviceCaps) -> TestServicer {
    FaultServicer::new(
        Arc::new(IdleDevice::new(caps)),
        Arc::new(FixedDirectory::default()),
        FaultConfig::default(),
    )
}

pub(crate) fn packet(instance: u64, address: u64, access: AccessKind, utlb: u16) -> FaultPacket {
    FaultPacket {
        context: ContextHandle::new(instance, 0),
        address,
        timestamp: 0,
        access,
        fault_type: FaultType::InvalidPte,
        source: FaultSource {
            utlb: UtlbId(utlb),
            ..Default::default()
        },
    }
}

/// Translate every record to `translation` and sort into service order
pub(crate) fn translate_all(batch: &mut Batch, translation: &Translation) {
    for record in batch.records.iter_mut() {
        record.translation = Some(translation.clone());
    }
    order_by_context(batch);
    order_for_service(batch);
}
