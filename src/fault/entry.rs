//! Fault Records - Decoded replayable faults
//!
//! ## Packet Layout
//!
//! Each buffer slot holds one little-endian packet:
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 8    | instance pointer |
//! | 8      | 8    | fault address    |
//! | 16     | 8    | timestamp        |
//! | 24     | 1    | access type      |
//! | 25     | 1    | fault type       |
//! | 26     | 1    | subcontext       |
//! | 27     | 1    | GPC id           |
//! | 28     | 2    | uTLB id          |
//! | 30     | 1    | client id        |
//! | 31     | 1    | MMU engine id    |

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::{DecodeError, FatalReason};
use crate::hal::FAULT_PACKET_SIZE;
use crate::types::{page_align_down, AddressSpaceId, ContextHandle, DeviceId, UtlbId, PAGE_SIZE};
use crate::va_space::Translation;

// ============================================================================
// Access Kinds
// ============================================================================

/// Faulting access, ordered by intrusiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AccessKind {
    Prefetch = 0,
    Read = 1,
    Write = 2,
    AtomicWeak = 3,
    AtomicStrong = 4,
}

impl AccessKind {
    pub fn from_raw(raw: u8) -> Result<Self, DecodeError> {
        match raw {
            0 => Ok(AccessKind::Prefetch),
            1 => Ok(AccessKind::Read),
            2 => Ok(AccessKind::Write),
            3 => Ok(AccessKind::AtomicWeak),
            4 => Ok(AccessKind::AtomicStrong),
            _ => Err(DecodeError::InvalidAccessType(raw)),
        }
    }

    pub fn mask(self) -> AccessKindMask {
        AccessKindMask::from_bits_retain(1 << self as u8)
    }

    /// Write or atomic
    pub fn needs_write(self) -> bool {
        self >= AccessKind::Write
    }
}

bitflags! {
    /// Set of access kinds seen on one page
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessKindMask: u8 {
        const PREFETCH = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const ATOMIC_WEAK = 1 << 3;
        const ATOMIC_STRONG = 1 << 4;
    }
}

impl AccessKindMask {
    pub fn has(self, kind: AccessKind) -> bool {
        self.contains(kind.mask())
    }

    /// Most intrusive kind in the set
    pub fn highest(self) -> Option<AccessKind> {
        [
            AccessKind::AtomicStrong,
            AccessKind::AtomicWeak,
            AccessKind::Write,
            AccessKind::Read,
            AccessKind::Prefetch,
        ]
        .into_iter()
        .find(|k| self.has(*k))
    }
}

// ============================================================================
// Fault Types
// ============================================================================

/// Hardware fault type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultType {
    InvalidPde = 0,
    InvalidPdeSize = 1,
    InvalidPte = 2,
    LimitViolation = 3,
    UnboundInstance = 4,
    PrivilegeViolation = 5,
    Write = 6,
    Atomic = 7,
    ReadOnly = 8,
    UnsupportedAperture = 9,
    UnsupportedKind = 10,
    RegionViolation = 11,
    Poisoned = 12,
}

impl FaultType {
    pub fn from_raw(raw: u8) -> Result<Self, DecodeError> {
        Ok(match raw {
            0 => FaultType::InvalidPde,
            1 => FaultType::InvalidPdeSize,
            2 => FaultType::InvalidPte,
            3 => FaultType::LimitViolation,
            4 => FaultType::UnboundInstance,
            5 => FaultType::PrivilegeViolation,
            6 => FaultType::Write,
            7 => FaultType::Atomic,
            8 => FaultType::ReadOnly,
            9 => FaultType::UnsupportedAperture,
            10 => FaultType::UnsupportedKind,
            11 => FaultType::RegionViolation,
            12 => FaultType::Poisoned,
            _ => return Err(DecodeError::InvalidFaultType(raw)),
        })
    }

    /// Types no servicing can resolve
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            FaultType::LimitViolation
                | FaultType::UnboundInstance
                | FaultType::PrivilegeViolation
                | FaultType::UnsupportedAperture
                | FaultType::UnsupportedKind
                | FaultType::RegionViolation
                | FaultType::Poisoned
        )
    }
}

// ============================================================================
// Packet
// ============================================================================

/// Originating hardware unit of a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FaultSource {
    pub utlb: UtlbId,
    pub gpc_id: u8,
    pub client_id: u8,
    pub engine_id: u8,
}

/// A decoded buffer packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultPacket {
    pub context: ContextHandle,
    pub address: u64,
    pub timestamp: u64,
    pub access: AccessKind,
    pub fault_type: FaultType,
    pub source: FaultSource,
}

fn le_u64(bytes: &[u8; FAULT_PACKET_SIZE], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

impl FaultPacket {
    pub fn decode(bytes: &[u8; FAULT_PACKET_SIZE], utlb_count: u16) -> Result<Self, DecodeError> {
        let instance = le_u64(bytes, 0);
        if instance % PAGE_SIZE != 0 {
            return Err(DecodeError::MisalignedInstance(instance));
        }
        let utlb = u16::from_le_bytes([bytes[28], bytes[29]]);
        if utlb >= utlb_count {
            return Err(DecodeError::UtlbOutOfRange(utlb));
        }

        Ok(Self {
            context: ContextHandle::new(instance, bytes[26]),
            address: le_u64(bytes, 8),
            timestamp: le_u64(bytes, 16),
            access: AccessKind::from_raw(bytes[24])?,
            fault_type: FaultType::from_raw(bytes[25])?,
            source: FaultSource {
                utlb: UtlbId(utlb),
                gpc_id: bytes[27],
                client_id: bytes[30],
                engine_id: bytes[31],
            },
        })
    }

    pub fn encode(&self) -> [u8; FAULT_PACKET_SIZE] {
        let mut bytes = [0u8; FAULT_PACKET_SIZE];
        bytes[0..8].copy_from_slice(&self.context.instance.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.address.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[24] = self.access as u8;
        bytes[25] = self.fault_type as u8;
        bytes[26] = self.context.subcontext;
        bytes[27] = self.source.gpc_id;
        bytes[28..30].copy_from_slice(&self.source.utlb.0.to_le_bytes());
        bytes[30] = self.source.client_id;
        bytes[31] = self.source.engine_id;
        bytes
    }
}

// ============================================================================
// Fault Record
// ============================================================================

/// Which accesses a precise cancel aborts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelVaMode {
    #[default]
    All,
    /// Leave reads running
    WriteAndAtomic,
}

/// Final disposition of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultStatus {
    #[default]
    Pending,
    Serviced,
    Fatal,
    /// Skipped this round by the thrashing heuristic
    Throttled,
    /// Covered by another record
    Duplicate,
    /// Device no longer registered in the address space
    Stale,
    /// Prefetch to an address that cannot be serviced
    InvalidPrefetch,
}

/// One coalesced fault
#[derive(Debug, Clone)]
pub struct FaultRecord {
    /// Page-aligned faulting address
    pub address: u64,
    /// Most intrusive access seen
    pub access_kind: AccessKind,
    /// Every access kind seen
    pub access_mask: AccessKindMask,
    pub context: ContextHandle,
    pub source: FaultSource,
    pub fault_type: FaultType,
    pub timestamp: u64,
    /// Packets merged into this record, itself included
    pub num_instances: u32,
    pub is_fatal: bool,
    pub fatal_reason: Option<FatalReason>,
    pub cancel_mode: CancelVaMode,
    /// Merged into another record
    pub filtered: bool,
    /// Records merged into this one
    pub merged: Vec<usize>,
    pub translation: Option<Translation>,
    pub is_throttled: bool,
    pub is_invalid_prefetch: bool,
    pub status: FaultStatus,
}

impl FaultRecord {
    pub fn from_packet(packet: &FaultPacket) -> Self {
        let mut record = Self {
            address: page_align_down(packet.address),
            access_kind: packet.access,
            access_mask: packet.access.mask(),
            context: packet.context,
            source: packet.source,
            fault_type: packet.fault_type,
            timestamp: packet.timestamp,
            num_instances: 1,
            is_fatal: false,
            fatal_reason: None,
            cancel_mode: CancelVaMode::All,
            filtered: false,
            merged: Vec::new(),
            translation: None,
            is_throttled: false,
            is_invalid_prefetch: false,
            status: FaultStatus::Pending,
        };
        if packet.fault_type.is_fatal() {
            record.mark_fatal(FatalReason::InvalidFaultType, CancelVaMode::All);
        }
        record
    }

    /// Same context and page
    pub fn same_page(&self, other: &FaultRecord) -> bool {
        self.context == other.context && self.address == other.address
    }

    pub fn mark_fatal(&mut self, reason: FatalReason, mode: CancelVaMode) {
        self.is_fatal = true;
        self.fatal_reason = Some(reason);
        self.cancel_mode = mode;
        self.status = FaultStatus::Fatal;
    }

    pub fn space_id(&self) -> Option<AddressSpaceId> {
        self.translation.as_ref().map(|t| t.space_id())
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.translation.as_ref().map(|t| t.device)
    }

    /// Key of the service order: address space, device, page, then most
    /// intrusive access first
    pub fn service_key(&self) -> (AddressSpaceId, DeviceId, u64, core::cmp::Reverse<AccessKind>) {
        (
            self.space_id().unwrap_or(AddressSpaceId(u64::MAX)),
            self.device().unwrap_or(DeviceId(u32::MAX)),
            self.address,
            core::cmp::Reverse(self.access_kind),
        )
    }
}
