//! Device HAL - Fault buffer and host method interfaces
//!
//! The engine never touches device registers. A driver implements these
//! traits over its own register and push-buffer plumbing.
//!
//! ## Fault Buffer
//!
//! The replayable fault buffer is a ring of [`FAULT_PACKET_SIZE`] byte slots.
//! The GPU produces at PUT, the engine consumes at GET. A slot may be
//! published (PUT advanced) before its contents land, so every slot carries
//! a valid bit the engine must observe and then clear.
//!
//! ## Host Methods
//!
//! Replays and cancels are asynchronous. Each returns a [`Completion`] that
//! is collected in a [`Tracker`] and waited on before the engine depends on
//! the effect.

use alloc::vec::Vec;

use crate::error::{DecodeError, Result};
use crate::fault::entry::{CancelVaMode, FaultPacket, FaultSource};
use crate::types::{AddressSpaceId, ContextHandle};

/// Size of one packed fault packet
pub const FAULT_PACKET_SIZE: usize = 32;

// ============================================================================
// Replay and Flush Modes
// ============================================================================

/// Replay command variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayType {
    /// Retry faulted accesses
    Start,
    /// Retry and acknowledge every outstanding fault, so uTLBs with pending
    /// faults stop generating new ones until the next replay
    StartAckAll,
}

/// How a buffer flush finds the end of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Drop entries up to the last PUT the engine read
    CachedPut,
    /// Re-read PUT from the device and drop everything before it
    UpdatePut,
}

// ============================================================================
// Completions
// ============================================================================

/// Token for asynchronous device work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Completion(pub u64);

/// Set of outstanding completions
#[derive(Debug, Default)]
pub struct Tracker {
    pending: Vec<Completion>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, completion: Completion) {
        if !self.pending.contains(&completion) {
            self.pending.push(completion);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every tracked completion, stopping at the first failure
    pub fn wait<H: HostHal + ?Sized>(&mut self, host: &H) -> Result<()> {
        while let Some(completion) = self.pending.first().copied() {
            host.wait(completion)?;
            self.pending.remove(0);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Replayable fault buffer access
pub trait FaultBufferHal {
    /// Number of slots in the ring
    fn max_faults(&self) -> u32;

    /// Read the consumer cursor
    fn read_get(&self) -> u32;

    /// Read the producer cursor
    fn read_put(&self) -> u32;

    /// Publish the consumer cursor
    fn write_get(&self, get: u32);

    /// Whether the packet at `index` has landed
    fn entry_is_valid(&self, index: u32) -> bool;

    /// Return the slot at `index` to the hardware
    fn entry_clear_valid(&self, index: u32);

    /// Copy the raw packet at `index`
    fn read_entry(&self, index: u32, packet: &mut [u8; FAULT_PACKET_SIZE]);

    /// Read and decode the packet at `index`
    fn parse_entry(
        &self,
        index: u32,
        utlb_count: u16,
    ) -> core::result::Result<FaultPacket, DecodeError> {
        let mut raw = [0u8; FAULT_PACKET_SIZE];
        self.read_entry(index, &mut raw);
        FaultPacket::decode(&raw, utlb_count)
    }

    fn enable_prefetch_faults(&self);

    fn disable_prefetch_faults(&self);
}

/// Host methods pushed to the device
pub trait HostHal {
    fn replay(&self, kind: ReplayType) -> Result<Completion>;

    /// Cancel every fault of `context` on the uTLB described by `source`
    fn cancel_targeted(&self, context: ContextHandle, source: FaultSource) -> Result<Completion>;

    /// Cancel faults on one page of an address space
    fn cancel_precise(
        &self,
        space: AddressSpaceId,
        address: u64,
        mode: CancelVaMode,
    ) -> Result<Completion>;

    /// Cancel every fault of `context`
    fn cancel_global(&self, context: ContextHandle) -> Result<Completion>;

    /// Block until `completion` has finished
    fn wait(&self, completion: Completion) -> Result<()>;

    /// Monotonic time in nanoseconds
    fn now_ns(&self) -> u64;
}

/// Static device capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Number of uTLBs; decoded ids must be below this
    pub utlb_count: u16,
    /// Device supports per-address cancel
    pub cancel_va_supported: bool,
    /// Device supports targeted uTLB cancel
    pub targeted_cancel_supported: bool,
    /// Device can generate prefetch faults
    pub prefetch_faults_supported: bool,
    /// Device is partitioned (SMC)
    pub smc_enabled: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            utlb_count: 64,
            cancel_va_supported: false,
            targeted_cancel_supported: true,
            prefetch_faults_supported: true,
            smc_enabled: false,
        }
    }
}

/// A device the fault engine can service
pub trait FaultDevice: FaultBufferHal + HostHal + Send + Sync {
    fn caps(&self) -> DeviceCaps;
}
