//! Fault event reporting
//!
//! Tools hooks for cancelled accesses and replays. A fatal fault is reported
//! once for the representative record and once per instance coalesced into
//! it, so per-access tooling sees every cancelled access.

use crate::error::FatalReason;
use crate::fault::entry::FaultRecord;
use crate::types::AddressSpaceId;

/// Receiver for fault servicing events
pub trait FaultEventSink: Send + Sync {
    /// An access is about to be cancelled
    fn fatal_fault(&self, space: Option<AddressSpaceId>, record: &FaultRecord, reason: FatalReason) {
        let _ = (space, record, reason);
    }

    /// A replay was pushed for `batch_id`
    fn replay(&self, batch_id: u64) {
        let _ = batch_id;
    }
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl FaultEventSink for NullEventSink {}
