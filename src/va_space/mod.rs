//! Address Spaces - Fault owners and their backing
//!
//! An [`AddressSpace`] is what a fault context translates to. It owns:
//! - a region set ([`RegionAllocator`]) behind its own lock
//! - optionally the host process mapping ([`HostVm`]) for OS-backed memory
//! - the set of devices registered to fault in it
//!
//! Address spaces are reference counted and may be torn down while faults
//! referencing them are still in the buffer. The engine only ever holds one
//! address-space lock at a time.

pub mod host_vm;
pub mod region;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

use crate::error::LookupError;
use crate::types::{AddressSpaceId, ContextHandle, DeviceId};

pub use host_vm::{
    HostVm, MemoryPolicy, OsMapping, PopulateRequest, PopulateResult, RangeResidency,
};
pub use region::{
    ManagedRegion, RegionAllocator, ResidencyDecision, ServiceBlock, ServicePlan,
    ThrashingHeuristic, ThrashingHint,
};

// ============================================================================
// Address Space
// ============================================================================

/// A faultable address space
pub struct AddressSpace {
    /// Identifier
    id: AddressSpaceId,
    /// Region set, taken once per run of records in this space
    regions: Mutex<Box<dyn RegionAllocator>>,
    /// Owning process VM for OS-backed (ATS) addresses
    host_vm: Option<Arc<dyn HostVm>>,
    /// Devices allowed to fault in this space
    devices: Mutex<Vec<DeviceId>>,
    /// Set when a context was torn down and stale entries may be queued
    needs_fault_buffer_flush: AtomicBool,
}

impl AddressSpace {
    pub fn new(id: AddressSpaceId, regions: Box<dyn RegionAllocator>) -> Self {
        Self {
            id,
            regions: Mutex::new(regions),
            host_vm: None,
            devices: Mutex::new(Vec::new()),
            needs_fault_buffer_flush: AtomicBool::new(false),
        }
    }

    /// Attach the owning process VM
    pub fn with_host_vm(mut self, host_vm: Arc<dyn HostVm>) -> Self {
        self.host_vm = Some(host_vm);
        self
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Lock the region set
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn RegionAllocator>> {
        self.regions.lock()
    }

    pub fn host_vm(&self) -> Option<&Arc<dyn HostVm>> {
        self.host_vm.as_ref()
    }

    pub fn register_device(&self, device: DeviceId) {
        let mut devices = self.devices.lock();
        if !devices.contains(&device) {
            devices.push(device);
        }
    }

    pub fn unregister_device(&self, device: DeviceId) {
        self.devices.lock().retain(|d| *d != device);
    }

    pub fn is_registered(&self, device: DeviceId) -> bool {
        self.devices.lock().contains(&device)
    }

    /// Ask the servicer to flush the buffer before servicing this space again
    pub fn request_fault_buffer_flush(&self) {
        self.needs_fault_buffer_flush.store(true, Ordering::Release);
    }

    /// Consume a pending flush request
    pub fn take_fault_buffer_flush(&self) -> bool {
        self.needs_fault_buffer_flush.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("host_vm", &self.host_vm.is_some())
            .field("devices", &*self.devices.lock())
            .finish()
    }
}

// ============================================================================
// Translation
// ============================================================================

/// Result of translating a fault context
#[derive(Clone)]
pub struct Translation {
    pub space: Arc<AddressSpace>,
    pub device: DeviceId,
}

impl Translation {
    pub fn space_id(&self) -> AddressSpaceId {
        self.space.id()
    }
}

impl fmt::Debug for Translation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Translation")
            .field("space", &self.space.id())
            .field("device", &self.device)
            .finish()
    }
}

/// Maps fault contexts to address spaces
pub trait VaSpaceDirectory: Send + Sync {
    fn lookup(&self, context: ContextHandle) -> Result<Translation, LookupError>;
}
