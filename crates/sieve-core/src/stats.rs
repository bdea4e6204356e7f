//! Per-worker run statistics
//!
//! Each worker owns one slot, so writers never contend. A slot is guarded by
//! a sequence counter: odd while a write is in flight. Readers retry until
//! they see the same even value before and after reading, which rules out a
//! torn `(cnt, nsecs)` pair.

use crossbeam_utils::{Backoff, CachePadded};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

/// Aggregated statistics of one program
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgramStats {
    /// Completed runs
    pub cnt: u64,
    /// Total run time in nanoseconds
    pub nsecs: u64,
}

#[derive(Debug, Default)]
struct StatsSlot {
    seq: AtomicU32,
    cnt: AtomicU64,
    nsecs: AtomicU64,
}

impl StatsSlot {
    fn record(&self, nsecs: u64) {
        let backoff = Backoff::new();
        let mut seq = self.seq.load(Ordering::Relaxed);
        loop {
            if seq & 1 == 0 {
                match self.seq.compare_exchange_weak(
                    seq,
                    seq.wrapping_add(1),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => seq = current,
                }
            } else {
                backoff.spin();
                seq = self.seq.load(Ordering::Relaxed);
            }
        }
        fence(Ordering::Release);

        self.cnt.fetch_add(1, Ordering::Relaxed);
        self.nsecs.fetch_add(nsecs, Ordering::Relaxed);

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn read(&self) -> ProgramStats {
        let backoff = Backoff::new();
        loop {
            let start = self.seq.load(Ordering::Acquire);
            if start & 1 == 1 {
                backoff.snooze();
                continue;
            }
            let cnt = self.cnt.load(Ordering::Relaxed);
            let nsecs = self.nsecs.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == start {
                return ProgramStats { cnt, nsecs };
            }
        }
    }
}

/// Statistics slots of one program
#[derive(Debug)]
pub struct StatsSet {
    slots: Box<[CachePadded<StatsSlot>]>,
}

impl StatsSet {
    /// `slots` independent slots; at least one is always allocated
    pub fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots.max(1))
                .map(|_| CachePadded::new(StatsSlot::default()))
                .collect(),
        }
    }

    /// Number of slots
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Account one run of `nsecs` to `worker`'s slot
    #[inline]
    pub fn record(&self, worker: u32, nsecs: u64) {
        let idx = worker as usize % self.slots.len();
        self.slots[idx].record(nsecs);
    }

    /// Sum over all slots
    pub fn snapshot(&self) -> ProgramStats {
        self.slots.iter().fold(ProgramStats::default(), |acc, slot| {
            let s = slot.read();
            ProgramStats {
                cnt: acc.cnt + s.cnt,
                nsecs: acc.nsecs + s.nsecs,
            }
        })
    }
}

impl Default for StatsSet {
    fn default() -> Self {
        Self::new(1)
    }
}
