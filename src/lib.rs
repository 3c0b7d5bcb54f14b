//! gpu_fault - Replayable GPU page-fault servicing
//!
//! This crate consumes the replayable fault buffer a GPU MMU fills, resolves
//! each fault against its owning address space, makes the page accessible
//! through an external allocator or the host OS, and then replays or cancels
//! the faulting accesses.
//!
//! ## Pipeline
//!
//! ```text
//! fetch -> preprocess (translate, sort) -> dispatch -> replay
//!                                            |
//!                                            +-> managed block servicer
//!                                            +-> OS/ATS sub-servicer (+ prefetch)
//!          fatal records -> cancellation engine (re-enters fetch/preprocess)
//! ```
//!
//! Device registers, the VA allocator and the host VM subsystem are reached
//! only through the traits in [`hal`] and [`va_space`].

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Many device-side types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

// Core types
pub mod types;

pub mod config;
pub mod error;
pub mod events;
pub mod fault;
pub mod hal;
pub mod mask;
pub mod va_space;

pub use config::{CancelStrategy, FaultConfig, ReplayPolicy};
pub use error::{DecodeError, FatalReason, FaultError, LookupError};
pub use fault::{
    AccessKind, AccessKindMask, Batch, CancelVaMode, FaultPacket, FaultRecord, FaultServicer,
    FaultStatus, ServiceSummary,
};
pub use mask::PageMask;
pub use types::{AddressSpaceId, ContextHandle, DeviceId, Residency, UtlbId};
