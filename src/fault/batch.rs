//! Fault batches
//!
//! A [`Batch`] holds the records of one fetch-to-replay cycle. Records stay
//! in fetch order in `records`; `ordered` is the service order over the
//! records that were not merged away. After a buffer flush the batch is
//! stale and must be refetched.

use alloc::vec::Vec;

use crate::error::FatalReason;
use crate::fault::entry::{CancelVaMode, FaultRecord};
use crate::hal::Tracker;

/// Per-uTLB bookkeeping for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UtlbInfo {
    /// Packets fetched from this uTLB
    pub num_pending: u32,
    pub has_fatal: bool,
    /// Last record fetched from this uTLB
    pub last_fault: Option<usize>,
}

/// Records and counters of one servicing cycle
#[derive(Debug, Default)]
pub struct Batch {
    pub batch_id: u64,
    /// Records in fetch order
    pub records: Vec<FaultRecord>,
    /// Service order, indices into `records`
    pub ordered: Vec<usize>,
    /// Arena indexed by uTLB id
    pub utlbs: Vec<UtlbInfo>,
    /// Last record fetched, for cross-uTLB coalescing
    pub last_fault: Option<usize>,
    /// Packets read from the buffer
    pub num_cached: usize,
    pub num_duplicates: u32,
    pub num_invalid_prefetch: u32,
    pub has_fatal: bool,
    pub has_throttled: bool,
    /// Every record shares one context
    pub is_single_context: bool,
    /// Outstanding service and cancel work
    pub tracker: Tracker,
}

impl Batch {
    pub fn new(utlb_count: u16) -> Self {
        Self {
            utlbs: alloc::vec![UtlbInfo::default(); utlb_count as usize],
            is_single_context: true,
            ..Default::default()
        }
    }

    /// Clear for a new fetch, keeping allocations
    pub fn reset(&mut self, batch_id: u64) {
        self.batch_id = batch_id;
        self.records.clear();
        self.ordered.clear();
        for utlb in self.utlbs.iter_mut() {
            *utlb = UtlbInfo::default();
        }
        self.last_fault = None;
        self.num_cached = 0;
        self.num_duplicates = 0;
        self.num_invalid_prefetch = 0;
        self.has_fatal = false;
        self.has_throttled = false;
        self.is_single_context = true;
    }

    /// Records left after coalescing
    pub fn num_coalesced(&self) -> usize {
        self.records.iter().filter(|r| !r.filtered).count()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Mark a record fatal and update the batch and uTLB flags
    pub fn mark_fatal(&mut self, index: usize, reason: FatalReason, mode: CancelVaMode) {
        let record = &mut self.records[index];
        record.mark_fatal(reason, mode);
        let utlb = record.source.utlb.index();
        self.has_fatal = true;
        if let Some(info) = self.utlbs.get_mut(utlb) {
            info.has_fatal = true;
        }
    }

    /// Records (fetch order) that are fatal
    pub fn fatal_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_fatal && !r.filtered)
            .map(|(i, _)| i)
    }
}
