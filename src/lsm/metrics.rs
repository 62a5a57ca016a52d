//! Per-tree operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TreeMetrics {
    pub switches: AtomicU64,
    pub flushes: AtomicU64,
    pub blooms: AtomicU64,
    pub merges: AtomicU64,
    pub drops: AtomicU64,
    pub requeues: AtomicU64,
    pub bloom_hits: AtomicU64,
    pub bloom_misses: AtomicU64,
    pub bloom_false_positives: AtomicU64,
    pub throttle_ns: AtomicU64,
}

impl TreeMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            switches: self.switches.load(Ordering::SeqCst),
            flushes: self.flushes.load(Ordering::SeqCst),
            blooms: self.blooms.load(Ordering::SeqCst),
            merges: self.merges.load(Ordering::SeqCst),
            drops: self.drops.load(Ordering::SeqCst),
            requeues: self.requeues.load(Ordering::SeqCst),
            bloom_hits: self.bloom_hits.load(Ordering::SeqCst),
            bloom_misses: self.bloom_misses.load(Ordering::SeqCst),
            bloom_false_positives: self.bloom_false_positives.load(Ordering::SeqCst),
            throttle_ns: self.throttle_ns.load(Ordering::SeqCst),
        }
    }

    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Point-in-time copy of the counters, plus tree shape.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub switches: u64,
    pub flushes: u64,
    pub blooms: u64,
    pub merges: u64,
    pub drops: u64,
    pub requeues: u64,
    pub bloom_hits: u64,
    pub bloom_misses: u64,
    pub bloom_false_positives: u64,
    pub throttle_ns: u64,
}

/// Emit the counters and tree shape as one structured event.
pub fn log(name: &str, snapshot: &MetricsSnapshot, nchunks: usize, nold: usize, dsk_gen: u64) {
    tracing::info!(
        tree = name,
        chunks = nchunks,
        old_chunks = nold,
        dsk_gen = dsk_gen,
        switches = snapshot.switches,
        flushes = snapshot.flushes,
        blooms = snapshot.blooms,
        merges = snapshot.merges,
        drops = snapshot.drops,
        requeues = snapshot.requeues,
        bloom_hits = snapshot.bloom_hits,
        bloom_misses = snapshot.bloom_misses,
        bloom_false_positives = snapshot.bloom_false_positives,
        throttle_ns = snapshot.throttle_ns,
        "LSM tree metrics"
    );
}
