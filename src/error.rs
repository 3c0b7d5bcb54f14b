//! Error types for the fault engine using thiserror
//!
//! ## Taxonomy
//!
//! - **Decode**: corrupt packet data. Fatal to the fetch, surfaced.
//! - **Lookup**: stale context. Recovered by flushing, never surfaced.
//! - **Resource exhaustion**: aborts the dispatch pass, never attributed.
//! - **Per-record**: [`FatalReason`] on the record, handled by cancellation.
//! - **Global**: device state is untrustworthy, the batch is cancelled.

use thiserror::Error;

/// Top-level error type for fault servicing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FaultError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("out of memory")]
    OutOfMemory,

    #[error("service must be retried")]
    RetryService,

    #[error("uncorrectable ECC error")]
    Ecc,

    #[error("device error: {0}")]
    Device(&'static str),

    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl FaultError {
    /// Allocation-style failures that abort a pass without attribution
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, FaultError::OutOfMemory | FaultError::RetryService)
    }

    /// Failures that make the device state untrustworthy
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            FaultError::Ecc | FaultError::Device(_) | FaultError::Internal(_)
        )
    }
}

/// Packet decode errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid access type {0:#x}")]
    InvalidAccessType(u8),

    #[error("invalid fault type {0:#x}")]
    InvalidFaultType(u8),

    #[error("misaligned instance pointer {0:#x}")]
    MisalignedInstance(u64),

    #[error("uTLB {0} out of range")]
    UtlbOutOfRange(u16),
}

/// Context translation failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    /// The channel behind the instance pointer no longer exists
    #[error("channel gone")]
    ChannelGone,

    /// The channel is live but its subcontext's address space was torn down
    #[error("context torn down")]
    ContextTornDown,
}

/// Reason recorded against a cancelled access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FatalReason {
    InvalidAddress,
    InvalidPermissions,
    InvalidFaultType,
    OutOfMemory,
    InvalidOperation,
    InternalError,
}

impl From<&FaultError> for FatalReason {
    fn from(err: &FaultError) -> Self {
        match err {
            FaultError::OutOfMemory | FaultError::RetryService => FatalReason::OutOfMemory,
            FaultError::Decode(_) => FatalReason::InvalidFaultType,
            FaultError::Ecc | FaultError::Device(_) | FaultError::Internal(_) => {
                FatalReason::InternalError
            }
        }
    }
}

pub type Result<T> = core::result::Result<T, FaultError>;
