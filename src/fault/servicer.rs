//! Fault Servicer - Per-device servicing loop
//!
//! ## Cycle
//!
//! 1. Fetch a ready batch (coalesced)
//! 2. Preprocess: translate contexts and sort into service order
//! 3. Dispatch every record to its backing
//! 4. Adjust prefetch-fault generation
//! 5. On fatal records: wait for outstanding work, cancel, stop
//! 6. Otherwise replay per policy and loop
//!
//! The loop stops when the buffer is empty or a per-call limit is reached.
//! Whatever happened, the call ends with at least one START replay so the
//! device never stalls on faults nobody will replay.

use alloc::sync::Arc;

use log::{debug, error, trace, warn};

use crate::config::{FaultConfig, ReplayPolicy};
use crate::error::Result;
use crate::events::{FaultEventSink, NullEventSink};
use crate::fault::ats::AtsInvalidator;
use crate::fault::batch::Batch;
use crate::fault::buffer::{FaultBuffer, FetchMode};
use crate::fault::preprocess::BatchStatus;
use crate::fault::replay::ReplayController;
use crate::fault::service::{DispatchMode, DispatchStats};
use crate::fault::stats::FaultServiceStats;
use crate::hal::{DeviceCaps, FaultDevice, FlushMode, ReplayType};
use crate::va_space::{ThrashingHeuristic, VaSpaceDirectory};

/// Outcome of one [`FaultServicer::service_faults`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceSummary {
    /// Batches serviced; a batch discarded by a flush is not counted
    pub batches: u32,
    /// START replays pushed
    pub replays: u32,
    /// Records serviced
    pub serviced: u32,
    /// Records found fatal
    pub fatal: u32,
    /// Records skipped by the thrashing heuristic
    pub throttled: u32,
    /// Batches discarded because of a buffer flush
    pub flushed: u32,
    /// A cancellation ran
    pub cancelled: bool,
}

impl ServiceSummary {
    fn absorb(&mut self, stats: &DispatchStats) {
        self.serviced += stats.serviced;
        self.fatal += stats.fatal;
        self.throttled += stats.throttled;
    }
}

/// Replayable fault servicer for one device
pub struct FaultServicer<D: FaultDevice, V: VaSpaceDirectory> {
    pub(crate) device: Arc<D>,
    pub(crate) directory: Arc<V>,
    pub(crate) caps: DeviceCaps,
    pub(crate) config: FaultConfig,
    pub(crate) buffer: FaultBuffer,
    pub(crate) batch: Batch,
    pub(crate) replay: ReplayController,
    pub(crate) ats: AtsInvalidator,
    pub(crate) thrashing: Option<Arc<dyn ThrashingHeuristic>>,
    pub(crate) events: Arc<dyn FaultEventSink>,
    pub(crate) stats: FaultServiceStats,
    pub(crate) prefetch_faults_enabled: bool,
    prefetch_disabled_at_ns: u64,
    next_batch_id: u64,
}

impl<D: FaultDevice, V: VaSpaceDirectory> FaultServicer<D, V> {
    pub fn new(device: Arc<D>, directory: Arc<V>, config: FaultConfig) -> Self {
        let caps = device.caps();
        let config = config.validated(device.max_faults());
        let buffer = FaultBuffer::new(&*device, caps.utlb_count);
        let replay = ReplayController::new(config.replay_policy, config.replay_update_put_ratio);

        Self {
            batch: Batch::new(caps.utlb_count),
            prefetch_faults_enabled: caps.prefetch_faults_supported,
            device,
            directory,
            caps,
            config,
            buffer,
            replay,
            ats: AtsInvalidator::new(),
            thrashing: None,
            events: Arc::new(NullEventSink),
            stats: FaultServiceStats::new(),
            prefetch_disabled_at_ns: 0,
            next_batch_id: 0,
        }
    }

    pub fn with_thrashing(mut self, heuristic: Arc<dyn ThrashingHeuristic>) -> Self {
        self.thrashing = Some(heuristic);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn FaultEventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn stats(&self) -> &FaultServiceStats {
        &self.stats
    }

    /// The most recent batch
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn prefetch_faults_enabled(&self) -> bool {
        self.prefetch_faults_enabled
    }

    /// Whether the buffer holds unconsumed entries
    pub fn faults_pending(&mut self) -> bool {
        self.buffer.pending(&*self.device)
    }

    /// Drop every queued fault and replay, waiting for the replay
    pub fn flush(&mut self) -> Result<()> {
        self.flush_buffer(FlushMode::UpdatePut, ReplayType::Start)?;
        self.replay.wait(&*self.device)
    }

    pub fn enable_prefetch_faults(&mut self) {
        if self.caps.prefetch_faults_supported && !self.prefetch_faults_enabled {
            self.device.enable_prefetch_faults();
            self.prefetch_faults_enabled = true;
        }
    }

    pub fn disable_prefetch_faults(&mut self) {
        if self.caps.prefetch_faults_supported && self.prefetch_faults_enabled {
            self.device.disable_prefetch_faults();
            self.prefetch_faults_enabled = false;
            self.prefetch_disabled_at_ns = self.device.now_ns();
        }
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    pub(crate) fn next_batch_id(&mut self) -> u64 {
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        id
    }

    /// Push a replay once all outstanding work of the batch has finished
    pub(crate) fn push_replay(&mut self, kind: ReplayType) -> Result<()> {
        self.batch.tracker.wait(&*self.device)?;
        self.replay.push(&*self.device, kind)?;
        match kind {
            ReplayType::Start => self.stats.incr_replays(),
            ReplayType::StartAckAll => self.stats.incr_ack_all_replays(),
        }
        self.events.replay(self.batch.batch_id);
        Ok(())
    }

    /// Drop queued entries and replay
    pub(crate) fn flush_buffer(&mut self, mode: FlushMode, replay: ReplayType) -> Result<()> {
        self.buffer.flush(&*self.device, mode);
        self.stats.incr_flushes();
        debug!("fault buffer flushed ({:?}), replay {:?}", mode, replay);
        self.push_replay(replay)
    }

    /// Throttle prefetch faults when a batch is dominated by invalid ones
    fn update_prefetch_faults(&mut self) {
        let lapse_ms = self.config.reenable_prefetch_faults_lapse_ms;
        if !self.caps.prefetch_faults_supported || lapse_ms == 0 {
            return;
        }

        if !self.prefetch_faults_enabled {
            let now = self.device.now_ns();
            if now.saturating_sub(self.prefetch_disabled_at_ns) >= lapse_ms * 1_000_000 {
                debug!("re-enabling prefetch faults");
                self.enable_prefetch_faults();
            }
        } else if self.batch.num_invalid_prefetch as usize * 3 > self.config.max_batch_size * 2 {
            debug!(
                "disabling prefetch faults: {} invalid in batch {}",
                self.batch.num_invalid_prefetch, self.batch.batch_id
            );
            self.disable_prefetch_faults();
        }
    }

    // ========================================================================
    // Servicing loop
    // ========================================================================

    /// Service the buffer until it is empty or a per-call limit is reached
    pub fn service_faults(&mut self) -> Result<ServiceSummary> {
        self.replay.begin();
        let mut summary = ServiceSummary::default();
        let mut throttled_batches = 0;
        let mut status = Ok(());

        loop {
            if throttled_batches >= self.config.max_throttle_per_service
                || summary.batches >= self.config.max_batches_per_service
            {
                trace!("servicing limit reached after {} batches", summary.batches);
                break;
            }

            // Keep the last batch observable once the buffer runs dry
            if !self.buffer.pending(&*self.device) {
                break;
            }
            let batch_id = self.next_batch_id();
            self.batch.reset(batch_id);
            if let Err(err) = self.buffer.fetch(
                &*self.device,
                &mut self.batch,
                FetchMode::ReadyBatch,
                self.config.max_batch_size,
                self.config.coalesce,
            ) {
                error!("fault buffer decode failed: {}", err);
                status = Err(err);
                break;
            }
            if self.batch.is_empty() {
                break;
            }

            self.stats.incr_batches();
            FaultServiceStats::add(&self.stats.cached_faults, self.batch.num_cached as u64);
            FaultServiceStats::add(&self.stats.coalesced_faults, self.batch.num_coalesced() as u64);

            match self.preprocess() {
                Ok(BatchStatus::Ready) => {}
                Ok(BatchStatus::Flushed) => {
                    summary.flushed += 1;
                    continue;
                }
                Err(err) => {
                    status = Err(err);
                    break;
                }
            }

            let dispatched = self.dispatch(DispatchMode::Regular);
            self.update_prefetch_faults();
            match dispatched {
                Ok((batch_status, stats)) => {
                    summary.absorb(&stats);
                    if batch_status == BatchStatus::Flushed {
                        summary.flushed += 1;
                        continue;
                    }
                }
                Err(err) => {
                    if err.is_global() {
                        warn!("global error {}, cancelling batch {}", err, self.batch.batch_id);
                        if let Err(cancel_err) = self.cancel_batch(&err) {
                            error!("batch cancel failed: {}", cancel_err);
                        }
                        summary.cancelled = true;
                    } else {
                        warn!("servicing pass aborted: {}", err);
                    }
                    status = Err(err);
                    break;
                }
            }
            summary.batches += 1;

            if self.batch.has_fatal {
                summary.cancelled = true;
                status = self
                    .batch
                    .tracker
                    .wait(&*self.device)
                    .and_then(|_| self.cancel_fatal());
                if let Err(err) = &status {
                    error!("fault cancellation failed: {}", err);
                }
                break;
            }

            let replayed = match self.replay.policy() {
                ReplayPolicy::PerBatch => self.push_replay(ReplayType::Start),
                ReplayPolicy::PerBatchWithFlush => {
                    let mode = self.replay.flush_mode(&self.batch);
                    self.flush_buffer(mode, ReplayType::Start)
                        .and_then(|_| self.replay.wait(&*self.device))
                }
                ReplayPolicy::PerRegion | ReplayPolicy::Once => Ok(()),
            };
            if let Err(err) = replayed {
                status = Err(err);
                break;
            }

            if self.batch.has_throttled {
                throttled_batches += 1;
            }
        }

        if self.replay.needs_final_replay(status.is_ok()) {
            if let Err(err) = self.batch.tracker.wait(&*self.device) {
                warn!("outstanding work failed before final replay: {}", err);
                self.batch.tracker.clear();
            }
            let replayed = self.push_replay(ReplayType::Start);
            if status.is_ok() {
                status = replayed;
            }
        }
        let waited = self.replay.wait(&*self.device);
        if status.is_ok() {
            status = waited;
        }

        summary.replays = self.replay.num_replays();
        status.map(|_| summary)
    }
}
