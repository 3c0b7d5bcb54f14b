//! Fault Fetcher - Replayable buffer consumer
//!
//! Drains the hardware ring into a [`Batch`], merging duplicates on the way.
//!
//! ## Cursors
//!
//! The fetcher caches GET and PUT. PUT is re-read from the device only when
//! the cached cursors meet, and GET is written back only once the batch
//! holds everything up to it and only if it moved.
//!
//! ## Coalescing
//!
//! A new record merges into the last record of its uTLB when both share the
//! context and page, or into the last record of the batch when they share
//! context and page and the new access is no more intrusive. The merged
//! record keeps the most intrusive access and the union of all kinds.

use core::hint::spin_loop;
use core::mem;

use log::trace;

use crate::error::Result;
use crate::fault::batch::Batch;
use crate::fault::entry::{FaultRecord, FaultStatus};
use crate::hal::{FaultBufferHal, FlushMode};

/// How far a fetch reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Stop at the first slot that has not landed, bounded by batch size
    ReadyBatch,
    /// Read every slot before PUT, waiting for each to land
    DrainAll,
}

/// Consumer side of the replayable fault buffer
#[derive(Debug)]
pub struct FaultBuffer {
    cached_get: u32,
    cached_put: u32,
    max_faults: u32,
    utlb_count: u16,
}

impl FaultBuffer {
    pub fn new<H: FaultBufferHal + ?Sized>(hal: &H, utlb_count: u16) -> Self {
        Self {
            cached_get: hal.read_get(),
            cached_put: hal.read_put(),
            max_faults: hal.max_faults().max(1),
            utlb_count,
        }
    }

    pub fn cached_get(&self) -> u32 {
        self.cached_get
    }

    pub fn cached_put(&self) -> u32 {
        self.cached_put
    }

    #[inline]
    fn next(&self, index: u32) -> u32 {
        (index + 1) % self.max_faults
    }

    /// Fill `batch` from the buffer
    ///
    /// A decode error leaves the batch empty and the consumer cursor where
    /// it was.
    pub fn fetch<H: FaultBufferHal + ?Sized>(
        &mut self,
        hal: &H,
        batch: &mut Batch,
        mode: FetchMode,
        max_batch_size: usize,
        coalesce: bool,
    ) -> Result<()> {
        let start = self.cached_get;
        if mode == FetchMode::DrainAll || self.cached_get == self.cached_put {
            self.cached_put = hal.read_put();
        }
        let put = self.cached_put;
        let merge = coalesce && mode == FetchMode::ReadyBatch;

        let mut get = start;
        while get != put {
            if mode == FetchMode::ReadyBatch && batch.num_cached >= max_batch_size {
                break;
            }

            if !hal.entry_is_valid(get) {
                if mode == FetchMode::ReadyBatch && batch.num_cached > 0 {
                    break;
                }
                while !hal.entry_is_valid(get) {
                    spin_loop();
                }
            }

            let decoded = match hal.parse_entry(get, self.utlb_count) {
                Ok(decoded) => decoded,
                Err(err) => {
                    let batch_id = batch.batch_id;
                    batch.reset(batch_id);
                    return Err(err.into());
                }
            };
            coalesce_into(batch, FaultRecord::from_packet(&decoded), merge);
            get = self.next(get);
        }

        let mut index = start;
        while index != get {
            hal.entry_clear_valid(index);
            index = self.next(index);
        }
        if get != self.cached_get {
            self.cached_get = get;
            hal.write_get(get);
        }

        trace!(
            "batch {}: fetched {} faults, {} after coalescing",
            batch.batch_id,
            batch.num_cached,
            batch.num_coalesced()
        );
        Ok(())
    }

    /// Drop every entry before PUT
    pub fn flush<H: FaultBufferHal + ?Sized>(&mut self, hal: &H, mode: FlushMode) {
        if mode == FlushMode::UpdatePut {
            self.cached_put = hal.read_put();
        }
        let put = self.cached_put;
        let mut get = self.cached_get;
        while get != put {
            while !hal.entry_is_valid(get) {
                spin_loop();
            }
            hal.entry_clear_valid(get);
            get = self.next(get);
        }
        if get != self.cached_get {
            self.cached_get = get;
            hal.write_get(get);
        }
    }

    /// Whether the buffer holds unconsumed entries
    pub fn pending<H: FaultBufferHal + ?Sized>(&mut self, hal: &H) -> bool {
        if self.cached_get != self.cached_put || hal.entry_is_valid(self.cached_get) {
            return true;
        }
        self.cached_put = hal.read_put();
        self.cached_get != self.cached_put
    }
}

/// Record to merge `record` into, if any
fn merge_target(batch: &Batch, record: &FaultRecord) -> Option<usize> {
    let utlb_last = batch
        .utlbs
        .get(record.source.utlb.index())
        .and_then(|info| info.last_fault);
    if let Some(last) = utlb_last {
        let target = &batch.records[last];
        if !target.is_fatal && target.same_page(record) {
            return Some(last);
        }
    }
    if let Some(last) = batch.last_fault {
        let target = &batch.records[last];
        if !target.is_fatal && target.same_page(record) && record.access_kind <= target.access_kind {
            return Some(last);
        }
    }
    None
}

/// Append `record` to the batch, merging it into an earlier record if
/// `coalesce` allows
pub(crate) fn coalesce_into(batch: &mut Batch, mut record: FaultRecord, coalesce: bool) {
    let index = batch.records.len();
    let utlb = record.source.utlb.index();

    batch.num_cached += 1;
    if batch.records.first().is_some_and(|first| first.context != record.context) {
        batch.is_single_context = false;
    }
    if let Some(info) = batch.utlbs.get_mut(utlb) {
        info.num_pending += 1;
        if record.is_fatal {
            info.has_fatal = true;
        }
    }
    if record.is_fatal {
        batch.has_fatal = true;
    }

    let target = if coalesce && !record.is_fatal {
        merge_target(batch, &record)
    } else {
        None
    };

    match target {
        Some(target) if record.access_kind <= batch.records[target].access_kind => {
            let existing = &mut batch.records[target];
            existing.num_instances += 1;
            existing.access_mask |= record.access_mask;
            existing.merged.push(index);
            record.filtered = true;
            record.status = FaultStatus::Duplicate;
            batch.records.push(record);
        }
        Some(target) => {
            // The newcomer is more intrusive and takes over as representative
            let existing = &mut batch.records[target];
            record.num_instances += existing.num_instances;
            record.access_mask |= existing.access_mask;
            record.merged = mem::take(&mut existing.merged);
            record.merged.push(target);
            existing.filtered = true;
            existing.status = FaultStatus::Duplicate;
            batch.records.push(record);
            if let Some(info) = batch.utlbs.get_mut(utlb) {
                info.last_fault = Some(index);
            }
            if batch.last_fault == Some(target) {
                batch.last_fault = Some(index);
            }
        }
        None => {
            batch.records.push(record);
            if let Some(info) = batch.utlbs.get_mut(utlb) {
                info.last_fault = Some(index);
            }
            batch.last_fault = Some(index);
        }
    }
}
