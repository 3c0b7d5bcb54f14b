//! Batch Preprocessor and Address-Space Translator
//!
//! ## Translation
//!
//! Records are grouped by context first so each run of equal handles costs
//! one directory lookup; the rest of the run copies the translation.
//!
//! A failed lookup means the buffer may hold entries for a context that is
//! going away. The buffer is flushed and the batch must be refetched:
//!
//! - **ContextTornDown**: the channel is live but its address space is gone.
//!   No address space is left to cancel precisely in, so the channel's
//!   faults are cancelled coarsely (targeted on partitioned devices, global
//!   otherwise) before the flush.
//! - **ChannelGone**: the entries are simply stale.
//!
//! ## Service Order
//!
//! Address space, device, page, then access intrusiveness descending. One
//! address-space lock then covers a contiguous run, and the first record of
//! each page carries its most demanding access.

use log::{trace, warn};

use crate::error::{LookupError, Result};
use crate::fault::batch::Batch;
use crate::fault::servicer::FaultServicer;
use crate::hal::{FaultDevice, FlushMode, ReplayType};
use crate::va_space::VaSpaceDirectory;

/// Whether a batch can still be serviced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Ready,
    /// The buffer was flushed; the batch is stale and must be refetched
    Flushed,
}

/// Rebuild `ordered` from the non-merged records, grouped by context
pub(crate) fn order_by_context(batch: &mut Batch) {
    let Batch {
        records,
        ordered,
        is_single_context,
        ..
    } = batch;
    ordered.clear();
    ordered.extend((0..records.len()).filter(|i| !records[*i].filtered));
    if !*is_single_context {
        ordered.sort_by_key(|i| records[*i].context);
    }
}

/// Sort `ordered` into service order
pub(crate) fn order_for_service(batch: &mut Batch) {
    let Batch {
        records, ordered, ..
    } = batch;
    ordered.sort_by(|a, b| records[*a].service_key().cmp(&records[*b].service_key()));
}

impl<D: FaultDevice, V: VaSpaceDirectory> FaultServicer<D, V> {
    /// Translate and sort the current batch
    pub(crate) fn preprocess(&mut self) -> Result<BatchStatus> {
        order_by_context(&mut self.batch);
        if self.translate()? == BatchStatus::Flushed {
            return Ok(BatchStatus::Flushed);
        }
        order_for_service(&mut self.batch);
        trace!(
            "batch {}: {} records in service order",
            self.batch.batch_id,
            self.batch.ordered.len()
        );
        Ok(BatchStatus::Ready)
    }

    fn translate(&mut self) -> Result<BatchStatus> {
        let mut previous: Option<usize> = None;

        for pos in 0..self.batch.ordered.len() {
            let index = self.batch.ordered[pos];
            let context = self.batch.records[index].context;

            if let Some(prev) = previous {
                if self.batch.records[prev].context == context {
                    let translation = self.batch.records[prev].translation.clone();
                    self.batch.records[index].translation = translation;
                    continue;
                }
            }

            match self.directory.lookup(context) {
                Ok(translation) => {
                    self.batch.records[index].translation = Some(translation);
                    previous = Some(index);
                }
                Err(LookupError::ContextTornDown) => {
                    let source = self.batch.records[index].source;
                    warn!(
                        "context {:#x}/{} torn down, cancelling its faults",
                        context.instance, context.subcontext
                    );
                    let completion = if self.caps.smc_enabled {
                        self.device.cancel_targeted(context, source)?
                    } else {
                        self.device.cancel_global(context)?
                    };
                    self.batch.tracker.add(completion);
                    self.stats.incr_cancels();
                    self.flush_buffer(FlushMode::UpdatePut, ReplayType::Start)?;
                    return Ok(BatchStatus::Flushed);
                }
                Err(LookupError::ChannelGone) => {
                    trace!("stale entries for channel {:#x}", context.instance);
                    self.flush_buffer(FlushMode::UpdatePut, ReplayType::Start)?;
                    return Ok(BatchStatus::Flushed);
                }
            }
        }

        Ok(BatchStatus::Ready)
    }
}
