//! Chunk descriptors.
//!
//! A chunk is one ordered table in the tree: either the single mutable
//! primary at the tail of the active array, or an immutable sealed table.
//! The descriptor tracks identity, lifecycle state, and the worker reference
//! counts that keep a chunk's storage alive while it is being read or
//! filtered.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crate::error::{Error, Result};

/// Lifecycle of a chunk. Legal transitions:
///
/// ```text
/// Active --switch--> Sealing --flush--> OnDisk --bloom--> Bloomed
///                                         |                  |
///                                         +----merge in------+
///                                         v                  v
///                                       Merging --installed--> Retired
///                                         |
///                                         +--merge failed--> OnDisk/Bloomed
/// ```
///
/// Merge outputs are born directly in `OnDisk` (`Chunk::merged`). `empty`
/// and `evicted` are independent of the state machine: both can apply to any
/// state at or past `OnDisk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ChunkState {
    /// Writable primary.
    Active = 0,
    /// Switched out, awaiting flush.
    Sealing = 1,
    /// Durable on disk.
    OnDisk = 2,
    /// Durable, with a Bloom filter.
    Bloomed = 3,
    /// Selected as a merge input; read-only for everyone.
    Merging = 4,
    /// Replaced by a merge output; waiting on the drop worker.
    Retired = 5,
}

impl ChunkState {
    fn from_u32(v: u32) -> ChunkState {
        match v {
            0 => ChunkState::Active,
            1 => ChunkState::Sealing,
            2 => ChunkState::OnDisk,
            3 => ChunkState::Bloomed,
            4 => ChunkState::Merging,
            _ => ChunkState::Retired,
        }
    }
}

#[derive(Debug)]
pub struct Chunk {
    id: u32,
    generation: u32,
    uri: String,
    bloom_uri: String,
    create_ts: Instant,

    state: AtomicU32,

    /// Approximate record count, populated at seal.
    pub count: AtomicU64,
    /// Final byte size, populated at seal.
    pub size: AtomicU64,

    /// Largest transaction id permitted to have written here. While the
    /// chunk is primary this is the running max of writer ids; the switch
    /// stamps the final value.
    pub switch_txn: AtomicU64,

    /// Worker/cursor references; nonzero blocks the drop worker.
    pub refcnt: AtomicU32,
    /// Nonzero while a Bloom build streams the chunk.
    pub bloom_busy: AtomicU32,

    stable: AtomicBool,
    has_bloom: AtomicBool,
    empty: AtomicBool,
    evicted: AtomicBool,
    /// One flush worker at a time owns the chunk's image.
    flush_busy: AtomicBool,

    /// `dsk_gen` at retirement; droppable once a checkpoint covers it.
    retire_gen: AtomicU64,
}

impl Chunk {
    /// A fresh primary chunk.
    pub fn new(tree: &str, id: u32) -> Self {
        Self::with_state(tree, id, 0, ChunkState::Active)
    }

    /// A merge output of the given generation, already loaded on disk.
    pub fn merged(tree: &str, id: u32, generation: u32) -> Self {
        Self::with_state(tree, id, generation, ChunkState::OnDisk)
    }

    pub(crate) fn with_state(tree: &str, id: u32, generation: u32, state: ChunkState) -> Self {
        Self {
            id,
            generation,
            uri: format!("{tree}-{id}.lsm"),
            bloom_uri: format!("{tree}-{id}.bf"),
            create_ts: Instant::now(),
            state: AtomicU32::new(state as u32),
            count: AtomicU64::new(0),
            size: AtomicU64::new(0),
            switch_txn: AtomicU64::new(0),
            refcnt: AtomicU32::new(0),
            bloom_busy: AtomicU32::new(0),
            stable: AtomicBool::new(false),
            has_bloom: AtomicBool::new(false),
            empty: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            flush_busy: AtomicBool::new(false),
            retire_gen: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn bloom_uri(&self) -> &str {
        &self.bloom_uri
    }

    pub fn create_ts(&self) -> Instant {
        self.create_ts
    }

    pub fn state(&self) -> ChunkState {
        ChunkState::from_u32(self.state.load(Ordering::SeqCst))
    }

    /// Atomically move `from -> to`. `Busy` if another thread moved the
    /// chunk first; `Corrupt` if the edge is not in the lifecycle diagram.
    pub fn transition(&self, from: ChunkState, to: ChunkState) -> Result<()> {
        if !legal_edge(from, to) {
            return Err(Error::Corrupt(format!(
                "illegal chunk {} transition {from:?} -> {to:?}",
                self.id
            )));
        }
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    /// True for the writable primary.
    pub fn is_primary(&self) -> bool {
        self.state() == ChunkState::Active
    }

    /// True once the flush has completed.
    pub fn is_ondisk(&self) -> bool {
        self.state() >= ChunkState::OnDisk
    }

    pub fn is_stable(&self) -> bool {
        self.stable.load(Ordering::SeqCst)
    }

    pub fn set_stable(&self) {
        self.stable.store(true, Ordering::SeqCst);
    }

    pub fn has_bloom(&self) -> bool {
        self.has_bloom.load(Ordering::SeqCst)
    }

    pub fn set_bloom(&self) {
        self.has_bloom.store(true, Ordering::SeqCst);
    }

    /// Checkpoint image missing or poisoned by IO errors; merges and Bloom
    /// builds skip the chunk.
    pub fn is_empty_chunk(&self) -> bool {
        self.empty.load(Ordering::SeqCst)
    }

    pub fn mark_empty(&self) {
        self.empty.store(true, Ordering::SeqCst);
    }

    /// In-memory image released after flush.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    pub fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::SeqCst);
    }

    pub fn retire_gen(&self) -> u64 {
        self.retire_gen.load(Ordering::SeqCst)
    }

    pub fn set_retire_gen(&self, dsk_gen: u64) {
        self.retire_gen.store(dsk_gen, Ordering::SeqCst);
    }

    /// Fold a writer's transaction id into the pending switch stamp.
    pub fn note_writer(&self, txnid: u64) {
        self.switch_txn.fetch_max(txnid, Ordering::SeqCst);
    }

    /// Claim the chunk for flushing. False if another worker holds it.
    pub fn try_claim_flush(&self) -> bool {
        !self.flush_busy.swap(true, Ordering::SeqCst)
    }

    /// Give up a flush claim after a transient failure.
    pub fn unclaim_flush(&self) {
        self.flush_busy.store(false, Ordering::SeqCst);
    }
}

fn legal_edge(from: ChunkState, to: ChunkState) -> bool {
    use ChunkState::*;
    matches!(
        (from, to),
        (Active, Sealing)
            | (Sealing, OnDisk)
            | (OnDisk, Bloomed)
            | (OnDisk, Merging)
            | (Bloomed, Merging)
            | (Merging, OnDisk)
            | (Merging, Bloomed)
            | (Merging, Retired)
    )
}
