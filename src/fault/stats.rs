//! Fault servicing statistics

use core::sync::atomic::{AtomicU64, Ordering};

/// Per-servicer counters
#[derive(Debug, Default)]
pub struct FaultServiceStats {
    /// Batches fetched
    pub batches: AtomicU64,
    /// Packets read from the buffer
    pub cached_faults: AtomicU64,
    /// Records left after coalescing
    pub coalesced_faults: AtomicU64,
    pub duplicates: AtomicU64,
    pub invalid_prefetch: AtomicU64,
    pub throttled: AtomicU64,
    pub fatal: AtomicU64,
    /// Pages handed to the allocator or host VM
    pub serviced_pages: AtomicU64,
    pub replays: AtomicU64,
    pub ack_all_replays: AtomicU64,
    pub flushes: AtomicU64,
    pub cancels: AtomicU64,
    pub ats_invalidations: AtomicU64,
}

/// Plain copy of [`FaultServiceStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub batches: u64,
    pub cached_faults: u64,
    pub coalesced_faults: u64,
    pub duplicates: u64,
    pub invalid_prefetch: u64,
    pub throttled: u64,
    pub fatal: u64,
    pub serviced_pages: u64,
    pub replays: u64,
    pub ack_all_replays: u64,
    pub flushes: u64,
    pub cancels: u64,
    pub ats_invalidations: u64,
}

impl FaultServiceStats {
    pub const fn new() -> Self {
        Self {
            batches: AtomicU64::new(0),
            cached_faults: AtomicU64::new(0),
            coalesced_faults: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            invalid_prefetch: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            fatal: AtomicU64::new(0),
            serviced_pages: AtomicU64::new(0),
            replays: AtomicU64::new(0),
            ack_all_replays: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            cancels: AtomicU64::new(0),
            ats_invalidations: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_batches(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_replays(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_ack_all_replays(&self) {
        self.ack_all_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_flushes(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cancels(&self) {
        self.cancels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_ats_invalidations(&self) {
        self.ats_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            batches: load(&self.batches),
            cached_faults: load(&self.cached_faults),
            coalesced_faults: load(&self.coalesced_faults),
            duplicates: load(&self.duplicates),
            invalid_prefetch: load(&self.invalid_prefetch),
            throttled: load(&self.throttled),
            fatal: load(&self.fatal),
            serviced_pages: load(&self.serviced_pages),
            replays: load(&self.replays),
            ack_all_replays: load(&self.ack_all_replays),
            flushes: load(&self.flushes),
            cancels: load(&self.cancels),
            ats_invalidations: load(&self.ats_invalidations),
        }
    }
}
