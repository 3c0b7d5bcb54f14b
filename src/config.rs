//! Fault servicing configuration
//!
//! Tunables a driver exposes as module parameters. Every field has a default
//! matching production behavior; [`FaultConfig::validated`] clamps values a
//! caller may have set out of range.

/// When replays are pushed to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReplayPolicy {
    /// Replay after every serviced managed block
    PerRegion,
    /// Replay once per fetched batch
    PerBatch,
    /// Flush the buffer and replay once per fetched batch
    #[default]
    PerBatchWithFlush,
    /// Replay once at the end of the servicing call
    Once,
}

/// How fatal faults are cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CancelStrategy {
    /// Per-address cancel, requires device support
    PreciseVa,
    /// Multi-round uTLB lockdown with targeted cancels
    Lockdown,
    /// Global cancel of every context in the first faulting address space
    Coarse,
}

/// Fault servicing configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FaultConfig {
    /// Maximum records fetched per batch
    pub max_batch_size: usize,
    /// Replay policy
    pub replay_policy: ReplayPolicy,
    /// Duplicate percentage above which a per-batch flush re-reads PUT
    pub replay_update_put_ratio: u32,
    /// Batches serviced per call before yielding
    pub max_batches_per_service: u32,
    /// Batches with throttled faults allowed per call before yielding
    pub max_throttle_per_service: u32,
    /// Merge duplicate records while fetching
    pub coalesce: bool,
    /// Delay before re-enabling prefetch faults (0 disables throttling)
    pub reenable_prefetch_faults_lapse_ms: u64,
    /// Occupancy percentage for the bitmap-tree prefetcher
    pub prefetch_threshold: u32,
    /// Extend OS-backed servicing with prefetch
    pub ats_prefetch: bool,
    /// Override the cancel strategy derived from device capabilities
    pub cancel_strategy: Option<CancelStrategy>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            replay_policy: ReplayPolicy::PerBatchWithFlush,
            replay_update_put_ratio: 50,
            max_batches_per_service: 20,
            max_throttle_per_service: 5,
            coalesce: true,
            reenable_prefetch_faults_lapse_ms: 1000,
            prefetch_threshold: 51,
            ats_prefetch: true,
            cancel_strategy: None,
        }
    }
}

impl FaultConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_replay_policy(mut self, policy: ReplayPolicy) -> Self {
        self.replay_policy = policy;
        self
    }

    pub fn with_update_put_ratio(mut self, ratio: u32) -> Self {
        self.replay_update_put_ratio = ratio;
        self
    }

    pub fn with_max_batches_per_service(mut self, batches: u32) -> Self {
        self.max_batches_per_service = batches;
        self
    }

    pub fn with_max_throttle_per_service(mut self, batches: u32) -> Self {
        self.max_throttle_per_service = batches;
        self
    }

    pub fn with_coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    pub fn with_reenable_prefetch_lapse_ms(mut self, lapse: u64) -> Self {
        self.reenable_prefetch_faults_lapse_ms = lapse;
        self
    }

    pub fn with_prefetch_threshold(mut self, threshold: u32) -> Self {
        self.prefetch_threshold = threshold;
        self
    }

    pub fn with_ats_prefetch(mut self, enabled: bool) -> Self {
        self.ats_prefetch = enabled;
        self
    }

    pub fn with_cancel_strategy(mut self, strategy: CancelStrategy) -> Self {
        self.cancel_strategy = Some(strategy);
        self
    }

    /// Clamp out-of-range values
    ///
    /// `max_faults` is the device buffer capacity; a batch can never hold
    /// more records than the buffer has slots.
    pub fn validated(mut self, max_faults: u32) -> Self {
        let cap = (max_faults as usize).max(1);
        self.max_batch_size = self.max_batch_size.clamp(1, cap);
        self.replay_update_put_ratio = self.replay_update_put_ratio.min(100);
        self.prefetch_threshold = self.prefetch_threshold.clamp(1, 100);
        self.max_batches_per_service = self.max_batches_per_service.max(1);
        self.max_throttle_per_service = self.max_throttle_per_service.max(1);
        self
    }
}
