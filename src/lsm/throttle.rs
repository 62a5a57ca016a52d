//! Write throttling.
//!
//! Two rates, both in nanoseconds charged per update: `ckpt` rises when
//! sealed chunks pile up un-checkpointed, `merge` rises when chunks
//! accumulate faster than merges retire them. Rates are recomputed at every
//! switch from a moving estimate of how long the primary takes to fill, and
//! decay by halves once the pressure clears. The cursor charges the sum
//! after each update.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Unstable sealed chunks tolerated before checkpoint throttling starts.
const CKPT_LAG: usize = 2;
/// Ceiling on either rate, per update.
const MAX_NS_PER_UPDATE: u64 = 10_000_000; // 10ms

pub struct Throttle {
    ckpt_ns: AtomicU64,
    merge_ns: AtomicU64,
    /// Moving estimate of primary lifetime, smoothed as (3*old + new) / 4.
    chunk_fill_ms: AtomicU64,
    last_switch: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self {
            ckpt_ns: AtomicU64::new(0),
            merge_ns: AtomicU64::new(0),
            chunk_fill_ms: AtomicU64::new(0),
            last_switch: Mutex::new(None),
        }
    }

    /// Recompute both rates after a switch sealed the primary.
    ///
    /// `unstable` counts sealed chunks not yet covered by a checkpoint,
    /// `sealed` counts all non-primary chunks, `records` is the sealed
    /// chunk's record count, and `merge_behind` reports whether merges have
    /// stalled while chunks accumulate past the largest merge window.
    pub fn note_switch(&self, unstable: usize, sealed: usize, records: u64, merge_behind: bool) {
        let fill_ms = {
            let mut last = self.last_switch.lock().unwrap();
            let now = Instant::now();
            let elapsed = last.map(|t| now.duration_since(t).as_millis() as u64);
            *last = Some(now);
            match elapsed {
                None => 0,
                Some(ms) => {
                    let old = self.chunk_fill_ms.load(Ordering::SeqCst);
                    let smoothed = if old == 0 { ms } else { (3 * old + ms) / 4 };
                    self.chunk_fill_ms.store(smoothed, Ordering::SeqCst);
                    smoothed
                }
            }
        };

        // Nanoseconds one record "costs" while the primary fills.
        let ns_per_record = fill_ms.saturating_mul(1_000_000) / records.max(1);

        if unstable > CKPT_LAG {
            let rate = ns_per_record
                .saturating_mul((unstable - CKPT_LAG) as u64)
                .min(MAX_NS_PER_UPDATE);
            self.ckpt_ns.fetch_max(rate, Ordering::SeqCst);
        } else {
            decay(&self.ckpt_ns);
        }

        if merge_behind {
            let rate = ns_per_record
                .saturating_mul(sealed as u64)
                .min(MAX_NS_PER_UPDATE);
            self.merge_ns.fetch_max(rate, Ordering::SeqCst);
        } else {
            decay(&self.merge_ns);
        }
    }

    /// Checkpoint pressure cleared; start the decay immediately.
    pub fn note_checkpoint(&self) {
        decay(&self.ckpt_ns);
    }

    /// Merge pressure cleared; start the decay immediately.
    pub fn note_merge(&self) {
        decay(&self.merge_ns);
    }

    /// Total nanoseconds charged per update right now.
    pub fn rate_ns(&self) -> u64 {
        self.ckpt_ns.load(Ordering::SeqCst) + self.merge_ns.load(Ordering::SeqCst)
    }

    pub fn chunk_fill_ms(&self) -> u64 {
        self.chunk_fill_ms.load(Ordering::SeqCst)
    }

    /// Charge one update. Returns the nanoseconds slept.
    pub fn pause(&self) -> u64 {
        let ns = self.rate_ns();
        if ns > 0 {
            std::thread::sleep(Duration::from_nanos(ns));
        }
        ns
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

fn decay(rate: &AtomicU64) {
    let current = rate.load(Ordering::SeqCst);
    if current > 0 {
        rate.store(current / 2, Ordering::SeqCst);
    }
}
