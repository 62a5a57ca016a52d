//! The merging LSM cursor.
//!
//! A cursor captures the active chunk array at open time, holds one
//! sub-cursor per chunk, and merges their streams so the caller sees a
//! single ordered, snapshot-consistent table. Writes always land in the
//! primary chunk; reads walk chunks newest to oldest so fresher values
//! shadow older ones.
//!
//! Sub-cursors resolve snapshot visibility themselves: trailing chunks
//! whose switch stamp the snapshot cannot see are opened with the snapshot
//! attached, while fully visible older chunks are read unfiltered. The
//! cursor's own job is ordering, shadowing, and tombstone suppression.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use super::chunk::Chunk;
use super::state;
use super::tree::TreeInner;
use crate::bloom::BloomFilter;
use crate::errinput;
use crate::error::{Error, Result};
use crate::store::{ChunkCursor, CursorOptions, Record, SearchNear};
use crate::txn::Snapshot;

/// Writes re-check the primary's size every this many updates.
const SIZE_CHECK_INTERVAL: u64 = 100;
/// How long a writer waits for a replacement primary before giving up.
const SWITCH_WAIT: Duration = Duration::from_secs(5);
const SWITCH_RETRIES: u32 = 50;

/// Options an LSM cursor recognizes.
#[derive(Debug, Clone)]
pub struct CursorConfig {
    /// Stream chunks in merge order, surfacing tombstones. Read-only.
    pub bulk: bool,
    /// Keys and values are passed through untouched. Accepted for
    /// compatibility; this cursor is always raw.
    pub raw: bool,
    /// Inserts replace existing values instead of failing (default true).
    pub overwrite: bool,
    /// Read the named checkpoint image. Read-only; disables switching.
    pub checkpoint: Option<String>,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            bulk: false,
            raw: false,
            overwrite: true,
            checkpoint: None,
        }
    }
}

impl CursorConfig {
    /// Parse a comma-separated option string, e.g. `"overwrite=false"` or
    /// `"checkpoint=last"`. Unknown options are invalid input.
    pub fn parse(options: &str) -> Result<Self> {
        let mut config = Self::default();
        for token in options.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "bulk" => config.bulk = true,
                "raw" => config.raw = true,
                "overwrite" | "overwrite=true" => config.overwrite = true,
                "overwrite=false" => config.overwrite = false,
                _ => match token.strip_prefix("checkpoint=") {
                    Some(name) if !name.is_empty() => config.checkpoint = Some(name.to_string()),
                    _ => return errinput!("unknown cursor option {token:?}"),
                },
            }
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

pub struct LsmCursor {
    inner: Arc<TreeInner>,
    snapshot: Snapshot,
    /// The session pinned its snapshot; never advance it.
    snapshot_pinned: bool,
    overwrite: bool,
    merge_mode: bool,
    minor_merge: bool,
    checkpoint: Option<String>,

    chunks: Vec<Arc<Chunk>>,
    dsk_gen: u64,
    /// Trailing chunks that must be read through the snapshot.
    nupdates: usize,
    subs: Vec<Option<Box<dyn ChunkCursor>>>,
    blooms: Vec<Option<Arc<BloomFilter>>>,

    /// Sub-cursor has a key for the current direction.
    active: Vec<bool>,
    direction: Option<Direction>,
    last_key: Option<Vec<u8>>,
    update_count: u64,
}

impl LsmCursor {
    pub(crate) fn open(
        inner: Arc<TreeInner>,
        snapshot: Snapshot,
        snapshot_pinned: bool,
        config: CursorConfig,
    ) -> Result<Self> {
        if config.bulk && config.checkpoint.is_some() {
            return errinput!("bulk and checkpoint cursors are mutually exclusive");
        }
        let (mut chunks, dsk_gen) = inner.state.snapshot_chunks();
        if config.checkpoint.is_some() {
            // Checkpoint readers see only chunks with a durable image.
            let (dropped, kept): (Vec<_>, Vec<_>) = chunks
                .into_iter()
                .partition(|c| !c.is_ondisk() || c.is_empty_chunk());
            inner.state.release_chunks(&dropped);
            chunks = kept;
        }
        let mut cursor = Self {
            snapshot,
            snapshot_pinned,
            overwrite: config.overwrite,
            merge_mode: config.bulk,
            minor_merge: config.bulk,
            checkpoint: config.checkpoint,
            dsk_gen,
            nupdates: 0,
            subs: Vec::new(),
            blooms: Vec::new(),
            active: Vec::new(),
            direction: None,
            last_key: None,
            update_count: 0,
            chunks,
            inner,
        };
        cursor.rebuild_views()?;
        Ok(cursor)
    }

    /// A read-only cursor over exactly the given chunks, for merges.
    /// `minor` keeps tombstones in the stream.
    pub(crate) fn for_merge(inner: Arc<TreeInner>, chunks: Vec<Arc<Chunk>>, minor: bool) -> Result<Self> {
        inner.state.pin_chunks(&chunks);
        let mut cursor = Self {
            snapshot: inner.txns.snapshot(),
            snapshot_pinned: true,
            overwrite: false,
            merge_mode: true,
            minor_merge: minor,
            checkpoint: None,
            dsk_gen: 0,
            nupdates: 0,
            subs: Vec::new(),
            blooms: Vec::new(),
            active: Vec::new(),
            direction: None,
            last_key: None,
            update_count: 0,
            chunks,
            inner,
        };
        cursor.rebuild_views()?;
        Ok(cursor)
    }

    /// Rebuild the per-chunk vectors after (re)capturing the chunk list.
    fn rebuild_views(&mut self) -> Result<()> {
        let n = self.chunks.len();
        self.subs = std::iter::repeat_with(|| None).take(n).collect();
        self.active = vec![false; n];
        self.direction = None;

        self.nupdates = if self.merge_mode {
            n
        } else {
            let mut count = 0;
            for chunk in self.chunks.iter().rev() {
                let stamp = chunk.switch_txn.load(AtomicOrdering::SeqCst);
                if chunk.is_primary() || !self.snapshot.visible(stamp) {
                    count += 1;
                } else {
                    break;
                }
            }
            count
        };

        self.blooms = Vec::with_capacity(n);
        for chunk in &self.chunks {
            let bloom = if self.merge_mode {
                None
            } else {
                self.inner.bloom_for(chunk)?
            };
            self.blooms.push(bloom);
        }
        Ok(())
    }

    fn ensure_sub(&mut self, i: usize) -> Result<&mut Box<dyn ChunkCursor>> {
        if self.subs[i].is_none() {
            let boundary = self.chunks.len() - self.nupdates;
            let snapshot = if self.merge_mode || i < boundary {
                None
            } else {
                Some(self.snapshot)
            };
            let opts = CursorOptions {
                snapshot,
                checkpoint: self.checkpoint.clone(),
            };
            let sub = self.inner.store.open_cursor(self.chunks[i].uri(), opts)?;
            self.subs[i] = Some(sub);
        }
        Ok(self.subs[i].as_mut().unwrap())
    }

    /// Mid-iteration cursors keep their captured view until reset.
    fn pinned(&self) -> bool {
        self.direction.is_some()
    }

    fn stale(&self) -> bool {
        !self.merge_mode
            && self.checkpoint.is_none()
            && self.dsk_gen != self.inner.state.dsk_gen.load(AtomicOrdering::SeqCst)
    }

    fn refresh_if_stale(&mut self) -> Result<()> {
        if self.stale() && !self.pinned() {
            self.refresh()?;
        }
        Ok(())
    }

    /// Cursors from unpinned sessions read at the latest committed state:
    /// outside iteration, advance the snapshot and reopen sub-cursors so a
    /// session sees its own completed writes.
    fn sync_snapshot(&mut self) -> Result<()> {
        if self.snapshot_pinned || self.merge_mode || self.checkpoint.is_some() || self.pinned() {
            return Ok(());
        }
        let latest = self.inner.txns.snapshot();
        if latest != self.snapshot {
            self.snapshot = latest;
            self.rebuild_views()?;
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        self.inner.state.release_chunks(&self.chunks);
        let (chunks, dsk_gen) = self.inner.state.snapshot_chunks();
        self.chunks = chunks;
        self.dsk_gen = dsk_gen;
        self.rebuild_views()
    }

    /// Release the position and pick up any structural changes.
    pub fn reset(&mut self) -> Result<()> {
        for sub in self.subs.iter_mut().flatten() {
            sub.reset();
        }
        self.active.iter_mut().for_each(|a| *a = false);
        self.direction = None;
        self.last_key = None;
        self.refresh_if_stale()
    }

    /// Point lookup: the newest visible value for the key, walking chunks
    /// newest to oldest, consulting Bloom filters on sealed chunks first.
    pub fn search(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.direction = None;
        self.refresh_if_stale()?;
        self.sync_snapshot()?;
        self.last_key = Some(key.to_vec());

        for i in (0..self.chunks.len()).rev() {
            if self.chunks[i].is_empty_chunk() {
                continue;
            }
            let mut bloom_said_yes = false;
            if let Some(bloom) = &self.blooms[i] {
                if !bloom.contains(key) {
                    self.inner.metrics.bump(&self.inner.metrics.bloom_misses);
                    continue;
                }
                bloom_said_yes = true;
                self.inner.metrics.bump(&self.inner.metrics.bloom_hits);
            }

            let sub = self.ensure_sub(i)?;
            if sub.search(key)? {
                // A tombstone shadows everything older.
                return Ok(sub.value()?.map(<[u8]>::to_vec));
            }
            if bloom_said_yes {
                self.inner
                    .metrics
                    .bump(&self.inner.metrics.bloom_false_positives);
            }
        }
        Ok(None)
    }

    /// Position at the key or its nearest visible neighbor.
    pub fn search_near(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>, SearchNear)>> {
        if let Some(value) = self.search(key)? {
            return Ok(Some((key.to_vec(), value, SearchNear::Exact)));
        }

        self.last_key = Some(key.to_vec());
        self.direction = None;
        if let Some((k, v)) = self.next()? {
            return Ok(Some((k, v, SearchNear::After)));
        }

        self.last_key = Some(key.to_vec());
        self.direction = None;
        if let Some((k, v)) = self.prev()? {
            return Ok(Some((k, v, SearchNear::Before)));
        }
        Ok(None)
    }

    /// Next key in order. Tombstoned keys are skipped unless the cursor is
    /// in minor-merge mode.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            match self.step(Direction::Forward)? {
                None => return Ok(None),
                Some((key, Some(value), _)) => return Ok(Some((key, value))),
                Some((key, None, _)) if self.minor_merge => return Ok(Some((key, Vec::new()))),
                Some(_) => continue,
            }
        }
    }

    /// Previous key in order, with the same tombstone handling as `next`.
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            match self.step(Direction::Backward)? {
                None => return Ok(None),
                Some((key, Some(value), _)) => return Ok(Some((key, value))),
                Some((key, None, _)) if self.minor_merge => return Ok(Some((key, Vec::new()))),
                Some(_) => continue,
            }
        }
    }

    /// Raw merge step: the next (key, record) pair including tombstones,
    /// for feeding bulk loads.
    pub(crate) fn next_record(&mut self) -> Result<Option<(Vec<u8>, Record)>> {
        Ok(self.step(Direction::Forward)?.map(|(key, value, txnid)| {
            (key, Record { txnid, value })
        }))
    }

    /// One merge-iteration step: reposition or advance sub-cursors, then
    /// yield the winning entry.
    fn step(&mut self, dir: Direction) -> Result<Option<(Vec<u8>, Option<Vec<u8>>, u64)>> {
        if self.direction != Some(dir) {
            self.refresh_if_stale()?;
            self.sync_snapshot()?;
            self.reposition(dir)?;
            self.direction = Some(dir);
        } else if self.last_key.is_some() {
            self.advance_past_last(dir)?;
        }

        // The smallest (or largest) key wins; among equal keys the newest
        // chunk, i.e. the highest index, wins. Older sub-cursors left
        // sitting on the winning key are advanced on the next step.
        let mut winner: Option<usize> = None;
        for i in 0..self.subs.len() {
            if !self.active[i] {
                continue;
            }
            let key = self.subs[i].as_ref().unwrap().key()?;
            let better = match winner {
                None => true,
                Some(w) => {
                    let wkey = self.subs[w].as_ref().unwrap().key()?;
                    match dir {
                        Direction::Forward => key <= wkey,
                        Direction::Backward => key >= wkey,
                    }
                }
            };
            if better {
                winner = Some(i);
            }
        }

        match winner {
            None => {
                self.last_key = None;
                Ok(None)
            }
            Some(w) => {
                let sub = self.subs[w].as_ref().unwrap();
                let key = sub.key()?.to_vec();
                let value = sub.value()?.map(<[u8]>::to_vec);
                let txnid = sub.txnid()?;
                self.last_key = Some(key.clone());
                Ok(Some((key, value, txnid)))
            }
        }
    }

    /// Position every sub-cursor strictly past `last_key` in the given
    /// direction (or at the extreme when there is no position), via a
    /// single `search_near` each.
    fn reposition(&mut self, dir: Direction) -> Result<()> {
        let last = self.last_key.clone();
        for i in 0..self.chunks.len() {
            if self.chunks[i].is_empty_chunk() {
                self.active[i] = false;
                continue;
            }
            self.ensure_sub(i)?;
            let sub = self.subs[i].as_mut().unwrap();
            self.active[i] = match &last {
                None => {
                    sub.reset();
                    match dir {
                        Direction::Forward => sub.next()?,
                        Direction::Backward => sub.prev()?,
                    }
                }
                Some(key) => match sub.search_near(key)? {
                    None => false,
                    Some(SearchNear::Exact) => match dir {
                        Direction::Forward => sub.next()?,
                        Direction::Backward => sub.prev()?,
                    },
                    Some(SearchNear::After) => match dir {
                        Direction::Forward => true,
                        Direction::Backward => sub.prev()?,
                    },
                    Some(SearchNear::Before) => match dir {
                        Direction::Forward => sub.next()?,
                        Direction::Backward => true,
                    },
                },
            };
        }
        Ok(())
    }

    /// Advance every sub-cursor still sitting on the key returned last.
    fn advance_past_last(&mut self, dir: Direction) -> Result<()> {
        let last = match &self.last_key {
            Some(key) => key.clone(),
            None => return Ok(()),
        };
        for i in 0..self.subs.len() {
            if !self.active[i] {
                continue;
            }
            let sub = self.subs[i].as_mut().unwrap();
            if sub.key()? == last.as_slice() {
                self.active[i] = match dir {
                    Direction::Forward => sub.next()?,
                    Direction::Backward => sub.prev()?,
                };
            }
        }
        Ok(())
    }

    /// Inserts or updates a key-value pair. With `overwrite=false` an
    /// existing visible value fails with `DuplicateKey`.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.overwrite && self.search(key)?.is_some() {
            return Err(Error::DuplicateKey);
        }
        self.put(key, Some(value))
    }

    /// Replace an existing visible value. `NotFound` if there is none.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.search(key)?.is_none() {
            return Err(Error::NotFound);
        }
        self.put(key, Some(value))
    }

    /// Write a tombstone over an existing visible value. `NotFound` if
    /// there is none.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        if self.search(key)?.is_none() {
            return Err(Error::NotFound);
        }
        self.put(key, None)
    }

    /// The write path: land the operation in the primary chunk.
    fn put(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if self.merge_mode || self.checkpoint.is_some() {
            return Err(Error::ReadOnly);
        }
        if !self.inner.state.has_flag(state::ACTIVE) {
            return Err(Error::Shutdown);
        }
        self.direction = None;
        self.refresh_if_stale()?;

        self.maybe_check_size()?;

        let mut retries = 0;
        loop {
            let Some((index, primary)) = self.writable_primary() else {
                // The primary was sealed and its replacement is not
                // installed yet; wait for the switch worker.
                let seen = self.inner.state.switch_seq();
                self.inner.request_switch(false)?;
                if !self.inner.state.wait_for_switch(seen, SWITCH_WAIT) {
                    return Err(Error::Busy);
                }
                self.refresh()?;
                retries += 1;
                if retries > SWITCH_RETRIES {
                    return Err(Error::Busy);
                }
                continue;
            };

            let txnid = self.inner.txns.allocate();
            // Record the writer before re-checking the seal: a concurrent
            // switch must stamp a switch_txn at or above our id.
            primary.note_writer(txnid);
            if !primary.is_primary() {
                // Sealed underneath us. The view is already refreshed;
                // the caller retries.
                self.refresh()?;
                return Err(Error::Rollback);
            }

            let sub = self.ensure_sub(index)?;
            sub.insert(key, value, txnid)?;
            break;
        }

        self.update_count += 1;
        if self.inner.state.has_flag(state::THROTTLE) {
            let charged = self.inner.throttle.pause();
            self.inner
                .metrics
                .throttle_ns
                .fetch_add(charged, AtomicOrdering::SeqCst);
        }
        Ok(())
    }

    fn writable_primary(&self) -> Option<(usize, Arc<Chunk>)> {
        let last = self.chunks.len().checked_sub(1)?;
        let chunk = &self.chunks[last];
        chunk.is_primary().then(|| (last, chunk.clone()))
    }

    /// Every `SIZE_CHECK_INTERVAL` updates, compare the primary's footprint
    /// against the configured bounds and request a switch when it is full.
    fn maybe_check_size(&mut self) -> Result<()> {
        if self.update_count % SIZE_CHECK_INTERVAL != 0 {
            return Ok(());
        }
        let Some((_, primary)) = self.writable_primary() else {
            return Ok(());
        };
        let stat = match self.inner.store.stat(primary.uri()) {
            Ok(stat) => stat,
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        if stat.bytes >= self.inner.config.chunk_max {
            self.inner.request_switch(true)?;
            return Err(Error::Busy);
        }
        if stat.bytes >= self.inner.config.chunk_size {
            self.inner.request_switch(false)?;
        }
        Ok(())
    }

    /// Close the cursor, releasing its chunk references.
    pub fn close(self) {}
}

impl Drop for LsmCursor {
    fn drop(&mut self) {
        self.inner.state.release_chunks(&self.chunks);
    }
}
