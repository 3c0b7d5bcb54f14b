//! Simulated device, allocator and host VM for servicing tests
//!
//! The [`MockGpu`] keeps a set of outstanding faults the way a real MMU
//! does: a fault sits in the ring until consumed, then waits for a replay.
//! A replay retires every consumed fault whose page has been granted the
//! access it needs and re-queues the rest. Cancels retire faults without
//! granting anything.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gpu_fault::error::{FatalReason, FaultError, LookupError};
use gpu_fault::events::FaultEventSink;
use gpu_fault::fault::{
    AccessKind, AccessKindMask, CancelVaMode, FaultPacket, FaultRecord, FaultSource, FaultType,
};
use gpu_fault::hal::{
    Completion, DeviceCaps, FaultBufferHal, FaultDevice, HostHal, ReplayType, FAULT_PACKET_SIZE,
};
use gpu_fault::mask::PageMask;
use gpu_fault::types::{
    page_address, page_align_down, AddressSpaceId, ContextHandle, DeviceId, RegionId, Residency,
    UtlbId,
};
use gpu_fault::va_space::{
    AddressSpace, HostVm, ManagedRegion, MemoryPolicy, OsMapping, PopulateRequest,
    PopulateResult, RangeResidency, RegionAllocator, ResidencyDecision, ServiceBlock, ServicePlan,
    ThrashingHeuristic, ThrashingHint, Translation, VaSpaceDirectory,
};
use gpu_fault::{FaultConfig, FaultServicer};

pub const DEV: DeviceId = DeviceId(0);
pub const RING_SIZE: u32 = 256;

pub type Servicer = FaultServicer<MockGpu, MockDirectory>;

// ============================================================================
// Grants
// ============================================================================

/// Access the device has been given per page, shared by every backing
#[derive(Debug, Default)]
pub struct Grants {
    pages: Mutex<HashMap<u64, AccessKind>>,
}

fn level(kind: AccessKind) -> AccessKind {
    if kind.needs_write() {
        AccessKind::Write
    } else {
        AccessKind::Read
    }
}

impl Grants {
    pub fn grant(&self, addr: u64, kind: AccessKind) {
        let mut pages = self.pages.lock().unwrap();
        let granted = pages.entry(page_align_down(addr)).or_insert(level(kind));
        if level(kind) > *granted {
            *granted = level(kind);
        }
    }

    pub fn satisfies(&self, addr: u64, kind: AccessKind) -> bool {
        let pages = self.pages.lock().unwrap();
        pages
            .get(&page_align_down(addr))
            .is_some_and(|granted| *granted >= level(kind))
    }

    pub fn granted(&self, addr: u64) -> Option<AccessKind> {
        self.pages.lock().unwrap().get(&page_align_down(addr)).copied()
    }
}

// ============================================================================
// Device
// ============================================================================

/// Host method received by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Replay(ReplayType),
    Targeted(ContextHandle, UtlbId),
    Precise(AddressSpaceId, u64, CancelVaMode),
    Global(ContextHandle),
}

/// How a fault left the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Replayed,
    Cancelled,
}

#[derive(Debug, Clone)]
struct Outstanding {
    id: u64,
    packet: FaultPacket,
    /// Sitting in the ring, not yet consumed
    queued: bool,
}

struct GpuState {
    slots: Vec<[u8; FAULT_PACKET_SIZE]>,
    slot_ids: Vec<Option<u64>>,
    valid: Vec<bool>,
    get: u32,
    put: u32,
    outstanding: Vec<Outstanding>,
    exits: Vec<(FaultPacket, Exit)>,
    ops: Vec<Op>,
    put_reads: usize,
    now_ns: u64,
    prefetch_enabled: bool,
    /// Instances whose channel is gone; their faults never come back
    gone: Vec<u64>,
    next_id: u64,
    next_completion: u64,
}

impl GpuState {
    fn enqueue(&mut self, raw: [u8; FAULT_PACKET_SIZE], id: Option<u64>) {
        let next = (self.put + 1) % RING_SIZE;
        assert_ne!(next, self.get, "fault ring overflow");
        let slot = self.put as usize;
        self.slots[slot] = raw;
        self.slot_ids[slot] = id;
        self.valid[slot] = true;
        self.put = next;
    }

    fn replay(&mut self, grants: &Grants) {
        let outstanding = std::mem::take(&mut self.outstanding);
        for mut fault in outstanding {
            if !fault.queued {
                if self.gone.contains(&fault.packet.context.instance) {
                    continue;
                }
                let access = fault.packet.access;
                if access == AccessKind::Prefetch || grants.satisfies(fault.packet.address, access)
                {
                    self.exits.push((fault.packet, Exit::Replayed));
                    continue;
                }
                self.enqueue(fault.packet.encode(), Some(fault.id));
                fault.queued = true;
            }
            self.outstanding.push(fault);
        }
    }

    fn cancel(&mut self, hit: impl Fn(&FaultPacket) -> bool) {
        let outstanding = std::mem::take(&mut self.outstanding);
        for fault in outstanding {
            if hit(&fault.packet) {
                self.exits.push((fault.packet, Exit::Cancelled));
            } else {
                self.outstanding.push(fault);
            }
        }
    }

    fn completion(&mut self) -> Completion {
        self.next_completion += 1;
        Completion(self.next_completion)
    }
}

/// A GPU with a replayable fault ring
pub struct MockGpu {
    caps: DeviceCaps,
    grants: Arc<Grants>,
    state: Mutex<GpuState>,
}

impl MockGpu {
    pub fn new(caps: DeviceCaps, grants: Arc<Grants>) -> Self {
        Self {
            caps,
            grants,
            state: Mutex::new(GpuState {
                slots: vec![[0u8; FAULT_PACKET_SIZE]; RING_SIZE as usize],
                slot_ids: vec![None; RING_SIZE as usize],
                valid: vec![false; RING_SIZE as usize],
                get: 0,
                put: 0,
                outstanding: Vec::new(),
                exits: Vec::new(),
                ops: Vec::new(),
                put_reads: 0,
                now_ns: 0,
                prefetch_enabled: caps.prefetch_faults_supported,
                gone: Vec::new(),
                next_id: 0,
                next_completion: 0,
            }),
        }
    }

    /// Raise a fault; it lands in the ring immediately
    pub fn raise(&self, packet: FaultPacket) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.outstanding.push(Outstanding {
            id,
            packet,
            queued: true,
        });
        state.enqueue(packet.encode(), Some(id));
    }

    /// Put raw bytes in the ring with no fault behind them
    pub fn raise_raw(&self, raw: [u8; FAULT_PACKET_SIZE]) {
        self.state.lock().unwrap().enqueue(raw, None);
    }

    /// Tear down the channel behind `instance`; its faults are dropped
    /// at the next replay
    pub fn channel_gone(&self, instance: u64) {
        self.state.lock().unwrap().gone.push(instance);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.state.lock().unwrap().now_ns += ms * 1_000_000;
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn count(&self, wanted: impl Fn(&Op) -> bool) -> usize {
        self.state.lock().unwrap().ops.iter().filter(|op| wanted(op)).count()
    }

    pub fn starts(&self) -> usize {
        self.count(|op| *op == Op::Replay(ReplayType::Start))
    }

    pub fn ack_alls(&self) -> usize {
        self.count(|op| *op == Op::Replay(ReplayType::StartAckAll))
    }

    pub fn outstanding(&self) -> Vec<FaultPacket> {
        let state = self.state.lock().unwrap();
        state.outstanding.iter().map(|f| f.packet).collect()
    }

    pub fn exits(&self) -> Vec<(FaultPacket, Exit)> {
        self.state.lock().unwrap().exits.clone()
    }

    pub fn exit_of(&self, packet: &FaultPacket) -> Option<Exit> {
        let state = self.state.lock().unwrap();
        state.exits.iter().find(|(p, _)| p == packet).map(|(_, e)| *e)
    }

    pub fn put_reads(&self) -> usize {
        self.state.lock().unwrap().put_reads
    }

    pub fn get(&self) -> u32 {
        self.state.lock().unwrap().get
    }

    pub fn prefetch_enabled(&self) -> bool {
        self.state.lock().unwrap().prefetch_enabled
    }
}

impl FaultBufferHal for MockGpu {
    fn max_faults(&self) -> u32 {
        RING_SIZE
    }

    fn read_get(&self) -> u32 {
        self.state.lock().unwrap().get
    }

    fn read_put(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.put_reads += 1;
        state.put
    }

    fn write_get(&self, get: u32) {
        let mut state = self.state.lock().unwrap();
        let mut index = state.get;
        while index != get {
            if let Some(id) = state.slot_ids[index as usize].take() {
                if let Some(fault) = state.outstanding.iter_mut().find(|f| f.id == id) {
                    fault.queued = false;
                }
            }
            index = (index + 1) % RING_SIZE;
        }
        state.get = get;
    }

    fn entry_is_valid(&self, index: u32) -> bool {
        self.state.lock().unwrap().valid[index as usize]
    }

    fn entry_clear_valid(&self, index: u32) {
        self.state.lock().unwrap().valid[index as usize] = false;
    }

    fn read_entry(&self, index: u32, packet: &mut [u8; FAULT_PACKET_SIZE]) {
        *packet = self.state.lock().unwrap().slots[index as usize];
    }

    fn enable_prefetch_faults(&self) {
        self.state.lock().unwrap().prefetch_enabled = true;
    }

    fn disable_prefetch_faults(&self) {
        self.state.lock().unwrap().prefetch_enabled = false;
    }
}

impl HostHal for MockGpu {
    fn replay(&self, kind: ReplayType) -> gpu_fault::error::Result<Completion> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::Replay(kind));
        state.replay(&self.grants);
        Ok(state.completion())
    }

    fn cancel_targeted(
        &self,
        context: ContextHandle,
        source: FaultSource,
    ) -> gpu_fault::error::Result<Completion> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::Targeted(context, source.utlb));
        state.cancel(|p| p.context == context && p.source.utlb == source.utlb);
        Ok(state.completion())
    }

    fn cancel_precise(
        &self,
        space: AddressSpaceId,
        address: u64,
        mode: CancelVaMode,
    ) -> gpu_fault::error::Result<Completion> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::Precise(space, address, mode));
        state.cancel(|p| {
            page_align_down(p.address) == address
                && (mode == CancelVaMode::All || p.access.needs_write())
        });
        Ok(state.completion())
    }

    fn cancel_global(&self, context: ContextHandle) -> gpu_fault::error::Result<Completion> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::Global(context));
        state.cancel(|p| p.context == context);
        Ok(state.completion())
    }

    fn wait(&self, _completion: Completion) -> gpu_fault::error::Result<()> {
        Ok(())
    }

    fn now_ns(&self) -> u64 {
        self.state.lock().unwrap().now_ns
    }
}

impl FaultDevice for MockGpu {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }
}

// ============================================================================
// Allocator
// ============================================================================

/// What the allocator was asked to do
#[derive(Debug, Default)]
pub struct RegionLog {
    pub applied: Vec<ServicePlan>,
    pub cancelled_blocks: usize,
}

/// Region set granting every planned page
pub struct MockRegions {
    regions: Vec<ManagedRegion>,
    read_only: Vec<u64>,
    invalid: Vec<u64>,
    fail: Option<FaultError>,
    /// Pages granted only on the given apply
    defer: HashMap<u64, u32>,
    grants: Arc<Grants>,
    log: Arc<Mutex<RegionLog>>,
}

impl MockRegions {
    pub fn new(grants: Arc<Grants>) -> Self {
        Self {
            regions: Vec::new(),
            read_only: Vec::new(),
            invalid: Vec::new(),
            fail: None,
            defer: HashMap::new(),
            grants,
            log: Arc::new(Mutex::new(RegionLog::default())),
        }
    }

    pub fn with_region(mut self, start: u64, end: u64) -> Self {
        let id = RegionId(self.regions.len() as u64 + 1);
        self.regions.push(ManagedRegion::new(id, start, end));
        self
    }

    pub fn read_only(mut self, addr: u64) -> Self {
        self.read_only.push(page_align_down(addr));
        self
    }

    pub fn invalid(mut self, addr: u64) -> Self {
        self.invalid.push(page_align_down(addr));
        self
    }

    pub fn failing(mut self, err: FaultError) -> Self {
        self.fail = Some(err);
        self
    }

    /// Grant `addr` only on the `applies`-th service of its page
    pub fn deferred(mut self, addr: u64, applies: u32) -> Self {
        self.defer.insert(page_align_down(addr), applies);
        self
    }

    pub fn log(&self) -> Arc<Mutex<RegionLog>> {
        Arc::clone(&self.log)
    }
}

impl RegionAllocator for MockRegions {
    fn find_region(&self, addr: u64) -> Option<ManagedRegion> {
        self.regions.iter().find(|r| r.contains(addr)).copied()
    }

    fn managed_overlaps(&self, start: u64, end: u64) -> bool {
        self.regions.iter().any(|r| r.start < end && start < r.end)
    }

    fn check_permission(
        &self,
        _region: &ManagedRegion,
        addr: u64,
        kind: AccessKind,
    ) -> Result<(), FatalReason> {
        let page = page_align_down(addr);
        if self.invalid.contains(&page) {
            return Err(FatalReason::InvalidAddress);
        }
        if kind.needs_write() && self.read_only.contains(&page) {
            return Err(FatalReason::InvalidPermissions);
        }
        Ok(())
    }

    fn is_authorized(&self, _: &ManagedRegion, _: DeviceId, addr: u64, kind: AccessKind) -> bool {
        self.grants.satisfies(addr, kind)
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
        block: &ServiceBlock,
        plan: &ServicePlan,
    ) -> Result<Option<Completion>, FaultError> {
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        let base = block.granule_base();
        for (page, kind) in plan.access.iter() {
            let addr = page_address(base, *page);
            if let Some(left) = self.defer.get_mut(&addr) {
                if *left > 1 {
                    *left -= 1;
                    continue;
                }
                *left = 0;
            }
            self.grants.grant(addr, *kind);
        }
        self.log.lock().unwrap().applied.push(plan.clone());
        Ok(None)
    }

    fn set_cancel(&mut self, _block: &ServiceBlock, _device: DeviceId) {
        self.log.lock().unwrap().cancelled_blocks += 1;
    }
}

// ============================================================================
// Host VM
// ============================================================================

pub fn os_mapping(start: u64, end: u64, writable: bool) -> OsMapping {
    OsMapping {
        start,
        end,
        readable: true,
        writable,
        policy: MemoryPolicy::default(),
    }
}

/// Process VM granting reads everywhere and writes where the mapping allows
pub struct MockHostVm {
    mappings: Vec<OsMapping>,
    grants: Arc<Grants>,
    pub requests: Mutex<Vec<PopulateRequest>>,
    pub invalidations: Mutex<Vec<(u64, u64)>>,
}

impl MockHostVm {
    pub fn new(grants: Arc<Grants>, mappings: Vec<OsMapping>) -> Self {
        Self {
            mappings,
            grants,
            requests: Mutex::new(Vec::new()),
            invalidations: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<PopulateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HostVm for MockHostVm {
    fn find_mapping(&self, addr: u64) -> Option<OsMapping> {
        self.mappings.iter().find(|m| m.contains(addr)).copied()
    }

    fn residency(&self, _device: DeviceId, _base: u64, _valid: PageMask) -> RangeResidency {
        RangeResidency::default()
    }

    fn populate_and_touch(
        &self,
        mapping: &OsMapping,
        request: &PopulateRequest,
    ) -> Result<PopulateResult, FaultError> {
        self.requests.lock().unwrap().push(*request);
        let read = request.read | request.write | request.prefetch;
        for page in read.iter() {
            self.grants
                .grant(page_address(request.base, page), AccessKind::Read);
        }
        let write = if mapping.writable {
            request.write
        } else {
            PageMask::new()
        };
        for page in write.iter() {
            self.grants
                .grant(page_address(request.base, page), AccessKind::Write);
        }
        Ok(PopulateResult { read, write })
    }

    fn tlb_invalidate(&self, _device: DeviceId, start: u64, end: u64) -> Result<(), FaultError> {
        self.invalidations.lock().unwrap().push((start, end));
        Ok(())
    }
}

// ============================================================================
// Directory, events and heuristics
// ============================================================================

#[derive(Default)]
pub struct MockDirectory {
    entries: Mutex<HashMap<u64, Result<Translation, LookupError>>>,
}

impl MockDirectory {
    pub fn insert(&self, instance: u64, entry: Result<Translation, LookupError>) {
        self.entries.lock().unwrap().insert(instance, entry);
    }
}

impl VaSpaceDirectory for MockDirectory {
    fn lookup(&self, context: ContextHandle) -> Result<Translation, LookupError> {
        self.entries
            .lock()
            .unwrap()
            .get(&context.instance)
            .cloned()
            .unwrap_or(Err(LookupError::ChannelGone))
    }
}

/// Sink keeping every fatal report
#[derive(Default)]
pub struct RecordingSink {
    pub fatal: Mutex<Vec<(Option<AddressSpaceId>, u64, FatalReason)>>,
    pub replays: AtomicUsize,
}

impl RecordingSink {
    pub fn fatal(&self) -> Vec<(Option<AddressSpaceId>, u64, FatalReason)> {
        self.fatal.lock().unwrap().clone()
    }
}

impl FaultEventSink for RecordingSink {
    fn fatal_fault(&self, space: Option<AddressSpaceId>, record: &FaultRecord, reason: FatalReason) {
        self.fatal
            .lock()
            .unwrap()
            .push((space, record.address, reason));
    }

    fn replay(&self, _batch_id: u64) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }
}

/// Heuristic throttling every page
pub struct AlwaysThrottle;

impl ThrashingHeuristic for AlwaysThrottle {
    fn hint(&self, _region: &ManagedRegion, _addr: u64, _device: DeviceId) -> ThrashingHint {
        ThrashingHint::Throttle
    }
}

// ============================================================================
// World
// ============================================================================

/// One GPU with its collaborators
pub struct World {
    pub gpu: Arc<MockGpu>,
    pub grants: Arc<Grants>,
    pub directory: Arc<MockDirectory>,
    pub sink: Arc<RecordingSink>,
}

impl World {
    pub fn new(caps: DeviceCaps) -> Self {
        let grants = Arc::new(Grants::default());
        Self {
            gpu: Arc::new(MockGpu::new(caps, Arc::clone(&grants))),
            grants,
            directory: Arc::new(MockDirectory::default()),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    pub fn regions(&self) -> MockRegions {
        MockRegions::new(Arc::clone(&self.grants))
    }

    pub fn host_vm(&self, mappings: Vec<OsMapping>) -> Arc<MockHostVm> {
        Arc::new(MockHostVm::new(Arc::clone(&self.grants), mappings))
    }

    /// Register an address space reached through `instances`
    pub fn space(
        &self,
        id: u64,
        instances: &[u64],
        regions: MockRegions,
        host_vm: Option<Arc<MockHostVm>>,
    ) -> Arc<AddressSpace> {
        let mut space = AddressSpace::new(AddressSpaceId(id), Box::new(regions));
        if let Some(vm) = host_vm {
            space = space.with_host_vm(vm);
        }
        let space = Arc::new(space);
        space.register_device(DEV);
        for instance in instances {
            self.directory.insert(
                *instance,
                Ok(Translation {
                    space: Arc::clone(&space),
                    device: DEV,
                }),
            );
        }
        space
    }

    pub fn servicer(&self, config: FaultConfig) -> Servicer {
        FaultServicer::new(
            Arc::clone(&self.gpu),
            Arc::clone(&self.directory),
            config,
        )
        .with_event_sink(self.sink.clone())
    }
}

pub fn fault(instance: u64, address: u64, access: AccessKind, utlb: u16) -> FaultPacket {
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

pub fn caps_precise() -> DeviceCaps {
    DeviceCaps {
        cancel_va_supported: true,
        ..Default::default()
    }
}

pub fn caps_coarse() -> DeviceCaps {
    DeviceCaps {
        cancel_va_supported: false,
        targeted_cancel_supported: false,
        ..Default::default()
    }
}
