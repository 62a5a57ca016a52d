//! Shared mutable state for one LSM tree.
//!
//! The controller is the sole writer of the active chunk array; every
//! structural mutation happens under the write lock and bumps `dsk_gen`.
//! Readers take the read lock just long enough to copy the chunk pointers
//! and the generation, then work from their own snapshot. `old_chunks`
//! holds retired merge inputs until the drop worker can unlink them.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use itertools::Itertools;

use super::chunk::{Chunk, ChunkState};
use crate::errcorrupt;
use crate::error::Result;

/// Workers are running.
pub const ACTIVE: u32 = 0x01;
/// A compact() call is driving the tree.
pub const COMPACTING: u32 = 0x02;
/// The primary is full; a switch unit is queued or imminent.
pub const NEED_SWITCH: u32 = 0x04;
/// The tree is open.
pub const OPEN: u32 = 0x08;
/// Updates are being rate limited.
pub const THROTTLE: u32 = 0x10;

pub struct TreeState {
    /// Active chunks, oldest first; the writable primary (if any) is last.
    pub chunks: RwLock<Vec<Arc<Chunk>>>,
    /// Retired merge inputs awaiting the drop worker.
    pub old_chunks: RwLock<Vec<Arc<Chunk>>>,

    /// Bumped on every structural change to the active array.
    pub dsk_gen: AtomicU64,
    /// `dsk_gen` covered by the last checkpoint; gates drops.
    pub stable_gen: AtomicU64,
    /// Last allocated chunk id.
    pub last_id: AtomicU32,

    flags: AtomicU32,

    /// Bumped whenever a merge completes; the planner uses it to detect
    /// stalls.
    pub merge_progressing: AtomicU64,
    /// Widens merge windows when the tree falls behind.
    pub merge_aggressiveness: AtomicU32,

    /// Writers blocked on a sealed primary wait here; the switch notifies.
    switch_seq: Mutex<u64>,
    switch_cond: Condvar,
}

impl TreeState {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            old_chunks: RwLock::new(Vec::new()),
            dsk_gen: AtomicU64::new(0),
            stable_gen: AtomicU64::new(0),
            last_id: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            merge_progressing: AtomicU64::new(0),
            merge_aggressiveness: AtomicU32::new(0),
            switch_seq: Mutex::new(0),
            switch_cond: Condvar::new(),
        }
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Set a flag, reporting whether this call was the one that set it.
    /// Serializes concurrent switch requests.
    pub fn try_set_flag(&self, flag: u32) -> bool {
        self.flags.fetch_or(flag, Ordering::SeqCst) & flag == 0
    }

    pub fn next_chunk_id(&self) -> u32 {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn bump_dsk_gen(&self) -> u64 {
        self.dsk_gen.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Copy the active array and its generation, pinning each chunk with a
    /// reference. Callers must pair with [`release_chunks`].
    pub fn snapshot_chunks(&self) -> (Vec<Arc<Chunk>>, u64) {
        let chunks = self.chunks.read().unwrap();
        for chunk in chunks.iter() {
            chunk.refcnt.fetch_add(1, Ordering::SeqCst);
        }
        (chunks.clone(), self.dsk_gen.load(Ordering::SeqCst))
    }

    /// Pin an explicit chunk set (a merge window) under the read lock.
    pub fn pin_chunks(&self, pinned: &[Arc<Chunk>]) {
        let _guard = self.chunks.read().unwrap();
        for chunk in pinned {
            chunk.refcnt.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn release_chunks(&self, chunks: &[Arc<Chunk>]) {
        for chunk in chunks {
            chunk.refcnt.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// The writable primary, if the tree currently has one.
    pub fn primary(&self) -> Option<Arc<Chunk>> {
        let chunks = self.chunks.read().unwrap();
        chunks.last().filter(|c| c.is_primary()).cloned()
    }

    /// Wake writers blocked on a sealed primary.
    pub fn notify_switch(&self) {
        let mut seq = self.switch_seq.lock().unwrap();
        *seq += 1;
        self.switch_cond.notify_all();
    }

    pub fn switch_seq(&self) -> u64 {
        *self.switch_seq.lock().unwrap()
    }

    /// Block until a switch completes past `seen`, or the timeout elapses.
    /// Returns false on timeout.
    pub fn wait_for_switch(&self, seen: u64, timeout: Duration) -> bool {
        let mut seq = self.switch_seq.lock().unwrap();
        while *seq == seen {
            let (guard, result) = self.switch_cond.wait_timeout(seq, timeout).unwrap();
            seq = guard;
            if result.timed_out() {
                return *seq != seen;
            }
        }
        true
    }

    /// Structural invariants over the active array: ids unique and, for
    /// switch-created chunks, increasing in array order; at most one
    /// primary and only at the tail; `switch_txn` non-decreasing across
    /// sealed chunks. Merge outputs carry fresh ids but inherit their
    /// window's switch stamp, so recency ordering rests on `switch_txn`.
    pub fn validate(&self) -> Result<()> {
        let chunks = self.chunks.read().unwrap();

        let mut seen = std::collections::HashSet::new();
        for chunk in chunks.iter() {
            if !seen.insert(chunk.id()) {
                return errcorrupt!("duplicate chunk id {}", chunk.id());
            }
        }

        for (a, b) in chunks
            .iter()
            .filter(|c| c.generation() == 0)
            .tuple_windows()
        {
            if a.id() >= b.id() {
                return errcorrupt!("chunk ids out of order: {} then {}", a.id(), b.id());
            }
        }

        // A Sealing chunk mid-array is a flush still in flight; only a
        // writable chunk off the tail is corruption.
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.state() == ChunkState::Active && i + 1 != chunks.len() {
                return errcorrupt!("writable chunk {} is not at the tail", chunk.id());
            }
        }

        let sealed_txns: Vec<u64> = chunks
            .iter()
            .filter(|c| !c.is_primary())
            .map(|c| c.switch_txn.load(Ordering::SeqCst))
            .collect();
        for (a, b) in sealed_txns.iter().tuple_windows() {
            if a > b {
                return errcorrupt!("switch txns out of order: {a} then {b}");
            }
        }

        Ok(())
    }
}

impl Default for TreeState {
    fn default() -> Self {
        Self::new()
    }
}
