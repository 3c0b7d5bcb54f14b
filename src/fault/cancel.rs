//! Cancellation Engine
//!
//! Fatal faults must be cancelled or the faulting warps never make progress.
//! How precisely depends on what the device can address:
//!
//! - **PreciseVa**: cancel by (address space, address). Exact.
//! - **Lockdown**: cancel by uTLB. Only safe once the uTLB is known to hold
//!   nothing but the fatal faults, so the canceller iterates until each
//!   offending uTLB is locked down.
//! - **Coarse**: cancel whole contexts of the first faulting address space.
//!
//! ## Lockdown Rounds
//!
//! ```text
//! Probing -> Flushing -> Refetching -> Reclassifying -> Cancelling -> Probing
//!                            |               |
//!                            +-> Done <------+
//! ```
//!
//! A START_ACK_ALL replay stops uTLBs with outstanding faults from taking new
//! ones. If the first fatal fault a uTLB showed last round shows up again
//! after the replay, the uTLB is locked down and a targeted cancel only hits
//! faults already in the buffer. One uTLB is cancelled per round, so the
//! machine stops after at most one round per offending uTLB plus the witness
//! round and the final empty round.

use alloc::vec::Vec;

use log::{debug, trace, warn};

use crate::config::CancelStrategy;
use crate::error::{FatalReason, FaultError, Result};
use crate::fault::batch::Batch;
use crate::fault::buffer::FetchMode;
use crate::fault::entry::{AccessKind, CancelVaMode, FaultRecord};
use crate::fault::preprocess::BatchStatus;
use crate::fault::service::DispatchMode;
use crate::fault::servicer::FaultServicer;
use crate::hal::{FaultDevice, FlushMode, ReplayType};
use crate::types::{ContextHandle, UtlbId};
use crate::va_space::VaSpaceDirectory;

// ============================================================================
// Lockdown State Machine
// ============================================================================

/// Lockdown canceller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPhase {
    /// Record witnesses from the previous round
    Probing,
    /// Flush and START_ACK_ALL
    Flushing,
    /// Drain the buffer without coalescing
    Refetching,
    /// Detect lockdown and re-service the batch in cancel mode
    Reclassifying,
    /// Cancel one locked-down uTLB
    Cancelling,
    Done,
}

/// A fault remembered to detect lockdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Witness {
    pub context: ContextHandle,
    pub address: u64,
    pub access_kind: AccessKind,
    pub utlb: UtlbId,
}

impl Witness {
    pub fn of(record: &FaultRecord) -> Self {
        Self {
            context: record.context,
            address: record.address,
            access_kind: record.access_kind,
            utlb: record.source.utlb,
        }
    }

    pub fn matches(&self, record: &FaultRecord) -> bool {
        *self == Self::of(record)
    }
}

/// Per-uTLB cancellation state, carried from round to round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UtlbCancelState {
    pub in_lockdown: bool,
    /// Cancelled during the current round
    pub cancelled: bool,
    pub witness: Option<Witness>,
}

/// State of one lockdown cancellation
#[derive(Debug)]
pub struct LockdownCanceller {
    phase: CancelPhase,
    utlbs: Vec<UtlbCancelState>,
    first_round: bool,
    rounds: u32,
    cancels: u32,
}

impl LockdownCanceller {
    pub fn new(utlb_count: u16) -> Self {
        Self {
            phase: CancelPhase::Probing,
            utlbs: alloc::vec![UtlbCancelState::default(); utlb_count as usize],
            first_round: true,
            rounds: 0,
            cancels: 0,
        }
    }

    pub fn phase(&self) -> CancelPhase {
        self.phase
    }

    /// Fetch rounds so far
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Targeted cancels issued so far
    pub fn cancels(&self) -> u32 {
        self.cancels
    }

    pub fn utlbs(&self) -> &[UtlbCancelState] {
        &self.utlbs
    }

    /// Remember the first fatal fault of every uTLB that had one
    pub fn record_witnesses(&mut self, batch: &Batch) {
        if self.first_round {
            self.first_round = false;
            return;
        }
        for (id, state) in self.utlbs.iter_mut().enumerate() {
            let has_fatal = batch.utlbs.get(id).is_some_and(|info| info.has_fatal);
            state.witness = if has_fatal {
                batch
                    .fatal_indices()
                    .map(|i| &batch.records[i])
                    .find(|r| r.source.utlb.index() == id)
                    .map(Witness::of)
            } else {
                None
            };
        }
    }

    /// Start a round: a uTLB is locked down when its witness reappeared
    pub fn classify(&mut self, batch: &Batch) {
        for state in self.utlbs.iter_mut() {
            state.cancelled = false;
            state.in_lockdown = state
                .witness
                .is_some_and(|w| batch.records.iter().any(|r| w.matches(r)));
        }
    }

    /// First fatal record whose uTLB can be cancelled safely
    ///
    /// The uTLB must be locked down and not cancelled this round. Its first
    /// fault must be the fatal record, and no later page of the uTLB may
    /// have only non-fatal faults, or the cancel would drop a good access.
    pub fn select_victim(&self, batch: &Batch) -> Option<usize> {
        batch.fatal_indices().find(|&index| {
            let utlb = batch.records[index].source.utlb;
            let Some(state) = self.utlbs.get(utlb.index()) else {
                return false;
            };
            if !state.in_lockdown || state.cancelled {
                return false;
            }
            let first = batch.records.iter().position(|r| r.source.utlb == utlb);
            first == Some(index) && !has_non_fatal_only_page(batch, index + 1, utlb)
        })
    }

    pub fn mark_cancelled(&mut self, utlb: UtlbId) {
        if let Some(state) = self.utlbs.get_mut(utlb.index()) {
            state.cancelled = true;
        }
        self.cancels += 1;
    }
}

/// Whether some page of `utlb` at or after `start` has only non-fatal faults
///
/// Pages are told apart by address space, so subcontexts sharing a space
/// share their pages.
fn has_non_fatal_only_page(batch: &Batch, start: usize, utlb: UtlbId) -> bool {
    let in_utlb = |r: &&FaultRecord| r.source.utlb == utlb;
    let same_space_page = |a: &FaultRecord, b: &FaultRecord| {
        a.address == b.address && a.space_id() == b.space_id()
    };
    batch.records[start.min(batch.records.len())..]
        .iter()
        .filter(in_utlb)
        .filter(|r| !r.is_fatal)
        .any(|candidate| {
            !batch
                .records
                .iter()
                .filter(in_utlb)
                .any(|r| r.is_fatal && same_space_page(r, candidate))
        })
}

// ============================================================================
// Servicer Integration
// ============================================================================

impl<D: FaultDevice, V: VaSpaceDirectory> FaultServicer<D, V> {
    /// Cancel strategy in effect; an override the device cannot honor is
    /// ignored
    pub fn cancel_strategy(&self) -> CancelStrategy {
        let caps = &self.caps;
        match self.config.cancel_strategy {
            Some(CancelStrategy::PreciseVa) if caps.cancel_va_supported => CancelStrategy::PreciseVa,
            Some(CancelStrategy::Lockdown) if caps.targeted_cancel_supported => {
                CancelStrategy::Lockdown
            }
            Some(CancelStrategy::Coarse) => CancelStrategy::Coarse,
            _ if caps.cancel_va_supported => CancelStrategy::PreciseVa,
            _ if caps.targeted_cancel_supported => CancelStrategy::Lockdown,
            _ => CancelStrategy::Coarse,
        }
    }

    /// Cancel the fatal records of the current batch
    pub(crate) fn cancel_fatal(&mut self) -> Result<()> {
        let strategy = self.cancel_strategy();
        debug!(
            "batch {}: cancelling fatal faults ({:?})",
            self.batch.batch_id, strategy
        );
        match strategy {
            CancelStrategy::PreciseVa => self.cancel_precise_va(None),
            CancelStrategy::Lockdown => {
                let rounds = self.cancel_lockdown()?;
                debug!("lockdown cancel finished after {} rounds", rounds);
                Ok(())
            }
            CancelStrategy::Coarse => self.cancel_coarse(),
        }
    }

    /// Cancel the whole batch after a global error
    pub(crate) fn cancel_batch(&mut self, err: &FaultError) -> Result<()> {
        let reason = FatalReason::from(err);
        if self.caps.cancel_va_supported {
            return self.cancel_precise_va(Some((CancelVaMode::All, reason)));
        }

        let mut contexts: Vec<ContextHandle> = Vec::new();
        for pos in 0..self.batch.ordered.len() {
            let index = self.batch.ordered[pos];
            self.batch.mark_fatal(index, reason, CancelVaMode::All);
            self.report_fatal(index, reason);
            let context = self.batch.records[index].context;
            if !contexts.contains(&context) {
                contexts.push(context);
            }
        }
        for context in contexts {
            warn!(
                "global cancel of context {:#x}/{}",
                context.instance, context.subcontext
            );
            let completion = self.device.cancel_global(context)?;
            self.batch.tracker.add(completion);
            self.stats.incr_cancels();
        }
        self.flush_buffer(FlushMode::UpdatePut, ReplayType::Start)
    }

    /// Report a fatal record and every instance merged into it
    pub(crate) fn report_fatal(&self, index: usize, reason: FatalReason) {
        let record = &self.batch.records[index];
        let space = record.space_id();
        self.events.fatal_fault(space, record, reason);
        for merged in record.merged.iter() {
            self.events
                .fatal_fault(space, &self.batch.records[*merged], reason);
        }
    }

    /// Cancel by address. With `all`, every record is cancelled with the
    /// given mode and reason instead of just the fatal ones.
    pub(crate) fn cancel_precise_va(&mut self, all: Option<(CancelVaMode, FatalReason)>) -> Result<()> {
        let mut pos = 0;
        while pos < self.batch.ordered.len() {
            let index = self.batch.ordered[pos];
            let Some(translation) = self.batch.records[index].translation.clone() else {
                trace!("untranslated record {} not cancelled", index);
                pos += 1;
                continue;
            };
            let space = translation.space;
            let space_id = space.id();

            let mut end = pos;
            while end < self.batch.ordered.len()
                && self.batch.records[self.batch.ordered[end]].space_id() == Some(space_id)
            {
                end += 1;
            }

            if !space.is_registered(translation.device) {
                trace!("device left address space {}, skipping cancel", space_id.0);
                pos = end;
                continue;
            }

            let _regions = space.lock();
            for p in pos..end {
                let index = self.batch.ordered[p];
                if let Some((mode, reason)) = all {
                    self.batch.mark_fatal(index, reason, mode);
                }
                let record = &self.batch.records[index];
                if !record.is_fatal {
                    continue;
                }
                let reason = record.fatal_reason.unwrap_or(FatalReason::InvalidAddress);
                let (address, mode) = (record.address, record.cancel_mode);
                self.report_fatal(index, reason);
                let completion = self.device.cancel_precise(space_id, address, mode)?;
                self.batch.tracker.add(completion);
                self.stats.incr_cancels();
            }
            pos = end;
        }

        self.flush_buffer(FlushMode::UpdatePut, ReplayType::Start)
    }

    /// Cancel every context of the first address space with a fatal record.
    /// Records of those contexts that were not fatal are reported with
    /// [`FatalReason::InvalidOperation`].
    pub(crate) fn cancel_coarse(&mut self) -> Result<()> {
        let records = &self.batch.records;
        let Some(first) = self.batch.ordered.iter().copied().find(|i| records[*i].is_fatal) else {
            return Ok(());
        };
        let space = records[first].space_id();

        let mut contexts: Vec<ContextHandle> = Vec::new();
        let mut members: Vec<usize> = Vec::new();
        for &index in self.batch.ordered.iter() {
            let record = &records[index];
            if record.space_id() != space {
                continue;
            }
            if !contexts.contains(&record.context) {
                contexts.push(record.context);
            }
            members.push(index);
        }

        // The global cancels take the good accesses of these contexts too
        for index in members {
            if !self.batch.records[index].is_fatal {
                self.batch
                    .mark_fatal(index, FatalReason::InvalidOperation, CancelVaMode::All);
            }
            let reason = self.batch.records[index]
                .fatal_reason
                .unwrap_or(FatalReason::InvalidAddress);
            self.report_fatal(index, reason);
        }
        for context in contexts {
            warn!(
                "coarse cancel of context {:#x}/{}",
                context.instance, context.subcontext
            );
            let completion = self.device.cancel_global(context)?;
            self.batch.tracker.add(completion);
            self.stats.incr_cancels();
        }
        self.flush_buffer(FlushMode::UpdatePut, ReplayType::Start)
    }

    /// Run the lockdown canceller to completion. Returns the rounds taken.
    pub(crate) fn cancel_lockdown(&mut self) -> Result<u32> {
        let restore_prefetch = self.prefetch_faults_enabled;
        if restore_prefetch {
            self.disable_prefetch_faults();
        }

        let mut machine = LockdownCanceller::new(self.caps.utlb_count);
        let mut result = Ok(());
        while machine.phase != CancelPhase::Done {
            if let Err(err) = self.lockdown_step(&mut machine) {
                result = Err(err);
                break;
            }
        }

        if restore_prefetch {
            self.enable_prefetch_faults();
        }
        let replayed = self.push_replay(ReplayType::Start);
        result.and(replayed).map(|_| machine.rounds)
    }

    /// Advance the lockdown canceller by one phase
    pub(crate) fn lockdown_step(&mut self, machine: &mut LockdownCanceller) -> Result<()> {
        machine.phase = match machine.phase {
            CancelPhase::Probing => {
                machine.record_witnesses(&self.batch);
                CancelPhase::Flushing
            }
            CancelPhase::Flushing => {
                self.flush_buffer(FlushMode::UpdatePut, ReplayType::StartAckAll)?;
                self.replay.wait(&*self.device)?;
                CancelPhase::Refetching
            }
            CancelPhase::Refetching => {
                let batch_id = self.next_batch_id();
                self.batch.reset(batch_id);
                self.buffer.fetch(
                    &*self.device,
                    &mut self.batch,
                    FetchMode::DrainAll,
                    self.config.max_batch_size,
                    false,
                )?;
                machine.rounds += 1;
                trace!(
                    "lockdown round {}: {} faults",
                    machine.rounds,
                    self.batch.num_cached
                );
                if self.batch.is_empty() {
                    CancelPhase::Done
                } else {
                    CancelPhase::Reclassifying
                }
            }
            CancelPhase::Reclassifying => {
                machine.classify(&self.batch);
                if self.preprocess()? == BatchStatus::Flushed {
                    CancelPhase::Probing
                } else {
                    match self.dispatch(DispatchMode::Cancel) {
                        Ok((BatchStatus::Flushed, _)) => CancelPhase::Probing,
                        Err(err) if err.is_resource_exhaustion() => {
                            warn!("lockdown round {} restarted: {}", machine.rounds, err);
                            CancelPhase::Probing
                        }
                        Err(err) => return Err(err),
                        Ok((BatchStatus::Ready, _)) if !self.batch.has_fatal => CancelPhase::Done,
                        Ok((BatchStatus::Ready, _)) => CancelPhase::Cancelling,
                    }
                }
            }
            CancelPhase::Cancelling => {
                if let Some(index) = machine.select_victim(&self.batch) {
                    let record = &self.batch.records[index];
                    let (context, source) = (record.context, record.source);
                    let reason = record.fatal_reason.unwrap_or(FatalReason::InvalidAddress);
                    self.report_fatal(index, reason);
                    debug!(
                        "targeted cancel of uTLB {} for context {:#x}",
                        source.utlb.0, context.instance
                    );
                    let completion = self.device.cancel_targeted(context, source)?;
                    self.batch.tracker.add(completion);
                    self.stats.incr_cancels();
                    machine.mark_cancelled(source.utlb);
                }
                CancelPhase::Probing
            }
            CancelPhase::Done => CancelPhase::Done,
        };
        Ok(())
    }
}
