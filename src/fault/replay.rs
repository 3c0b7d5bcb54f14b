//! Replay Controller
//!
//! Decides when faulted accesses are retried and tracks the completions of
//! the replay methods it pushes.
//!
//! ## Policies
//!
//! - **PerRegion**: replay after each serviced managed block
//! - **PerBatch**: replay once per batch
//! - **PerBatchWithFlush**: flush then replay once per batch; the flush
//!   re-reads PUT when the batch was dominated by duplicates
//! - **Once**: replay at the end of the servicing call
//!
//! Whatever the policy, a servicing call ends with at least one START replay.

use log::debug;

use crate::config::ReplayPolicy;
use crate::error::Result;
use crate::fault::batch::Batch;
use crate::hal::{FlushMode, HostHal, ReplayType, Tracker};

#[derive(Debug)]
pub struct ReplayController {
    policy: ReplayPolicy,
    update_put_ratio: u32,
    /// START replays pushed during the current servicing call
    num_replays: u32,
    /// START_ACK_ALL replays pushed during the current servicing call
    num_ack_all: u32,
    tracker: Tracker,
}

impl ReplayController {
    pub fn new(policy: ReplayPolicy, update_put_ratio: u32) -> Self {
        Self {
            policy,
            update_put_ratio,
            num_replays: 0,
            num_ack_all: 0,
            tracker: Tracker::new(),
        }
    }

    pub fn policy(&self) -> ReplayPolicy {
        self.policy
    }

    pub fn num_replays(&self) -> u32 {
        self.num_replays
    }

    pub fn num_ack_all(&self) -> u32 {
        self.num_ack_all
    }

    /// Start a servicing call
    pub fn begin(&mut self) {
        self.num_replays = 0;
        self.num_ack_all = 0;
    }

    /// Push a replay and track its completion
    pub fn push<H: HostHal + ?Sized>(&mut self, host: &H, kind: ReplayType) -> Result<()> {
        let completion = host.replay(kind)?;
        self.tracker.add(completion);
        match kind {
            ReplayType::Start => self.num_replays += 1,
            ReplayType::StartAckAll => self.num_ack_all += 1,
        }
        debug!("replay {:?} pushed", kind);
        Ok(())
    }

    /// Wait for every pushed replay
    pub fn wait<H: HostHal + ?Sized>(&mut self, host: &H) -> Result<()> {
        self.tracker.wait(host)
    }

    /// Flush mode for the per-batch flush
    ///
    /// PUT is re-read when duplicates exceed `update_put_ratio` percent of
    /// the packets fetched, so the duplicates still queued are dropped too.
    pub fn flush_mode(&self, batch: &Batch) -> FlushMode {
        let duplicates = batch.num_duplicates as u64 * 100;
        let threshold = batch.num_cached as u64 * self.update_put_ratio as u64;
        if duplicates > threshold {
            FlushMode::UpdatePut
        } else {
            FlushMode::CachedPut
        }
    }

    /// Whether the end of a servicing call must push a replay
    pub fn needs_final_replay(&self, succeeded: bool) -> bool {
        (self.policy == ReplayPolicy::Once && succeeded) || self.num_replays == 0
    }
}
