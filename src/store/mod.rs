//! The chunk store contract.
//!
//! The LSM engine never touches chunk file bytes itself: every chunk (the
//! mutable primary included) is an ordered key-value table owned by a store
//! implementing [`ChunkStore`], addressed by URI. The engine drives chunks
//! exclusively through positioned [`ChunkCursor`]s.
//!
//! Values are versioned. Each write appends a [`Record`] carrying the
//! writer's transaction id; a cursor opened with a snapshot surfaces, per
//! key, the newest record visible under that snapshot. A record holding
//! `None` is a tombstone and is surfaced as such, so merge cursors can carry
//! deletions forward.

pub mod map;

pub use map::MapStore;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::txn::Snapshot;

/// One version of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub txnid: u64,
    /// `None` is a tombstone.
    pub value: Option<Vec<u8>>,
}

/// Approximate footprint of a chunk, used by the switch policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStat {
    pub bytes: u64,
    pub records: u64,
}

/// Where `search_near` landed relative to the requested key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchNear {
    Exact,
    /// Positioned at the largest visible key below the target.
    Before,
    /// Positioned at the smallest visible key above the target.
    After,
}

/// How a chunk cursor resolves versions.
#[derive(Debug, Clone, Default)]
pub struct CursorOptions {
    /// Surface, per key, the newest record visible under this snapshot.
    /// `None` surfaces the newest record outright.
    pub snapshot: Option<Snapshot>,
    /// Read the chunk's durable checkpoint image instead of its live state.
    pub checkpoint: Option<String>,
}

/// An ordered table of versioned records, one per chunk.
pub trait ChunkStore: Send + Sync {
    /// Create an empty chunk.
    fn create(&self, uri: &str) -> Result<()>;

    /// Unlink a chunk's storage. Idempotent: a missing chunk is OK.
    fn drop_chunk(&self, uri: &str) -> Result<()>;

    /// Open a positioned cursor over the chunk.
    fn open_cursor(&self, uri: &str, opts: CursorOptions) -> Result<Box<dyn ChunkCursor>>;

    /// Persist the chunk's current contents as its durable image.
    fn checkpoint(&self, uri: &str) -> Result<()>;

    /// Release any cached in-memory image; later cursors reload the durable
    /// image. Only meaningful for chunks that have been checkpointed.
    fn release(&self, uri: &str) -> Result<()>;

    /// Populate a fresh chunk from a stream sorted by strictly increasing
    /// key. Fails with `Corrupt` on ordering violations.
    fn bulk_load(
        &self,
        uri: &str,
        stream: &mut dyn Iterator<Item = Result<(Vec<u8>, Record)>>,
    ) -> Result<()>;

    /// Rewrite the chunk's durable image to reclaim space.
    fn compact(&self, uri: &str) -> Result<()>;

    /// Approximate size and record count.
    fn stat(&self, uri: &str) -> Result<ChunkStat>;
}

/// A positioned cursor over one chunk.
///
/// `next`/`prev` from an unpositioned cursor start at the first/last visible
/// entry. All positioning methods skip keys with no record visible under the
/// cursor's snapshot.
pub trait ChunkCursor: Send {
    /// Position at exactly `key`. Returns false if the key has no visible
    /// record (the cursor is left unpositioned).
    fn search(&mut self, key: &[u8]) -> Result<bool>;

    /// Position at `key` or the nearest visible neighbor. Returns `None` if
    /// the chunk has no visible entries at all. Prefers the exact match,
    /// then the next key above, then the nearest below.
    fn search_near(&mut self, key: &[u8]) -> Result<Option<SearchNear>>;

    /// Advance to the next visible key. Returns false when exhausted.
    fn next(&mut self) -> Result<bool>;

    /// Step back to the previous visible key. Returns false when exhausted.
    fn prev(&mut self) -> Result<bool>;

    /// The positioned key. `NotFound` if unpositioned.
    fn key(&self) -> Result<&[u8]>;

    /// The positioned value; `None` is a tombstone. `NotFound` if
    /// unpositioned.
    fn value(&self) -> Result<Option<&[u8]>>;

    /// Transaction id of the positioned record.
    fn txnid(&self) -> Result<u64>;

    /// Append a version for `key`. `None` writes a tombstone.
    fn insert(&mut self, key: &[u8], value: Option<&[u8]>, txnid: u64) -> Result<()>;

    /// Replace the visible value. `NotFound` if the key has no visible
    /// record in this chunk.
    fn update(&mut self, key: &[u8], value: &[u8], txnid: u64) -> Result<()>;

    /// Write a tombstone over the visible value. `NotFound` if the key has
    /// no visible record in this chunk.
    fn remove(&mut self, key: &[u8], txnid: u64) -> Result<()>;

    /// Clear the position.
    fn reset(&mut self);
}
