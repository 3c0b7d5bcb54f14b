//! Replayable Fault Servicing
//!
//! One [`FaultServicer`] per GPU drains its replayable fault buffer in
//! fetch -> preprocess -> dispatch -> replay cycles.
//!
//! ## Modules
//!
//! - `entry`: packet decoder and fault records
//! - `buffer`: ring consumer and coalescing
//! - `batch`: per-cycle records and uTLB arena
//! - `preprocess`: context translation and service ordering
//! - `service`: per-address-space dispatch and backing selection
//! - `managed`: allocator-owned block servicing
//! - `ats`: OS-backed servicing and device TLB invalidation
//! - `prefetch`: prefetch proposals
//! - `cancel`: precise, lockdown and coarse cancellation
//! - `replay`: replay policies

pub mod ats;
pub mod batch;
pub mod buffer;
pub mod cancel;
pub mod entry;
pub mod managed;
pub mod prefetch;
pub mod preprocess;
pub mod replay;
pub mod service;
pub mod servicer;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use ats::{AtsInvalidator, AtsOutcome, AtsRequest};
pub use batch::{Batch, UtlbInfo};
pub use buffer::{FaultBuffer, FetchMode};
pub use cancel::{CancelPhase, LockdownCanceller, UtlbCancelState, Witness};
pub use entry::{
    AccessKind, AccessKindMask, CancelVaMode, FaultPacket, FaultRecord, FaultSource, FaultStatus,
    FaultType,
};
pub use preprocess::BatchStatus;
pub use replay::ReplayController;
pub use service::{DispatchMode, DispatchStats};
pub use servicer::{FaultServicer, ServiceSummary};
pub use stats::{FaultServiceStats, StatsSnapshot};
