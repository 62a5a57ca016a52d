//! The tree controller.
//!
//! `LsmTree` owns the shared engine state and the worker pool. The
//! controller is the only writer of the active chunk array: switches,
//! merge installs, and retirement all funnel through the write lock here
//! or in the merge engine, and every structural change bumps `dsk_gen`
//! and rewrites the persisted metadata record.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use super::chunk::{Chunk, ChunkState};
use super::cursor::{CursorConfig, LsmCursor};
use super::merge;
use super::meta::{ChunkRecord, TreeMeta};
use super::metrics::{self, MetricsSnapshot, TreeMetrics};
use super::state::{self, TreeState};
use super::throttle::Throttle;
use super::work::{WorkKind, WorkQueues, WorkUnit};
use super::worker::{self, WorkerPool};
use crate::bloom::BloomFilter;
use crate::config::TreeConfig;
use crate::errinput;
use crate::error::{Error, Result};
use crate::store::{ChunkStore, MapStore};
use crate::txn::{Session, TxnManager};

/// How long compact() waits for flushes and merges to make progress.
const COMPACT_TIMEOUT: Duration = Duration::from_secs(30);
const COMPACT_POLL: Duration = Duration::from_millis(10);

pub(crate) struct TreeInner {
    pub name: String,
    pub config: TreeConfig,
    pub store: Arc<dyn ChunkStore>,
    pub txns: Arc<TxnManager>,
    pub state: TreeState,
    pub queues: WorkQueues,
    pub throttle: Throttle,
    pub metrics: TreeMetrics,

    /// Open Bloom filter handles by chunk id.
    blooms: RwLock<HashMap<u32, Arc<BloomFilter>>>,
    /// merge_progressing as of the previous switch, for stall detection.
    last_merge_progress: AtomicU64,
    /// Serializes metadata rewrites from concurrent workers.
    meta_lock: Mutex<()>,
    meta_path: PathBuf,
}

impl TreeInner {
    /// Rewrite the persisted chunk-list record from the current array.
    pub fn persist_meta(&self) -> Result<()> {
        let _serial = self.meta_lock.lock().unwrap();
        let meta = {
            let chunks = self.state.chunks.read().unwrap();
            TreeMeta {
                last_id: self.state.last_id.load(Ordering::SeqCst),
                last_txn: self.txns.current(),
                chunks: chunks.iter().map(|c| ChunkRecord::of(c)).collect(),
            }
        };
        meta.write(&self.meta_path)
    }

    /// Ask for a switch. The NEED_SWITCH flag serializes concurrent
    /// requesters: only the first pushes a unit.
    pub fn request_switch(&self, force: bool) -> Result<()> {
        if force {
            self.queues.push(WorkUnit::forced(WorkKind::Switch))
        } else if self.state.try_set_flag(state::NEED_SWITCH) {
            self.queues.push(WorkUnit::new(WorkKind::Switch))
        } else {
            Ok(())
        }
    }

    /// Seal the primary and install a fresh one. Replays are no-ops: a
    /// unit that arrives after the switch already happened returns OK.
    pub fn switch(&self, force: bool) -> Result<()> {
        let mut sealed = None;
        {
            let mut chunks = self.state.chunks.write().unwrap();
            if let Some(primary) = chunks.last().filter(|c| c.is_primary()).cloned() {
                if !force && !self.state.has_flag(state::NEED_SWITCH) {
                    return Ok(());
                }
                let stat = self.store.stat(primary.uri()).unwrap_or_default();
                if stat.records == 0 {
                    self.state.clear_flag(state::NEED_SWITCH);
                    return Ok(());
                }

                // Stamp the largest transaction allowed in this chunk
                // before sealing; late writers compare against it.
                primary.note_writer(self.txns.current());
                primary.transition(ChunkState::Active, ChunkState::Sealing)?;
                primary.count.store(stat.records, Ordering::SeqCst);
                primary.size.store(stat.bytes, Ordering::SeqCst);
                sealed = Some(primary);
            }

            let id = self.state.next_chunk_id();
            let fresh = Arc::new(Chunk::new(&self.name, id));
            self.store.create(fresh.uri())?;
            chunks.push(fresh);
            self.state.bump_dsk_gen();
            self.state.clear_flag(state::NEED_SWITCH);
        }

        self.state.notify_switch();
        self.update_throttle();
        self.metrics.bump(&self.metrics.switches);
        self.persist_meta()?;

        if let Some(primary) = sealed {
            tracing::info!(
                tree = %self.name,
                chunk = primary.id(),
                records = primary.count.load(Ordering::SeqCst),
                bytes = primary.size.load(Ordering::SeqCst),
                "Sealed primary chunk"
            );
            // Best effort: a lost enqueue during shutdown is recovered by
            // the next flush scan.
            let _ = self.queues.push(WorkUnit::new(WorkKind::Flush));
        }
        Ok(())
    }

    /// Recompute both throttle rates from the array shape.
    fn update_throttle(&self) {
        let (unstable, sealed, records) = {
            let chunks = self.state.chunks.read().unwrap();
            let sealed: Vec<_> = chunks.iter().filter(|c| !c.is_primary()).collect();
            let unstable = sealed
                .iter()
                .filter(|c| c.is_ondisk() && !c.is_stable())
                .count();
            let records = sealed
                .last()
                .map_or(0, |c| c.count.load(Ordering::SeqCst));
            (unstable, sealed.len(), records)
        };

        let progress = self.state.merge_progressing.load(Ordering::SeqCst);
        let behind = sealed > self.config.merge_max as usize
            && progress == self.last_merge_progress.swap(progress, Ordering::SeqCst);

        self.throttle.note_switch(unstable, sealed, records, behind);
        if self.throttle.rate_ns() > 0 {
            self.state.set_flag(state::THROTTLE);
        } else {
            self.state.clear_flag(state::THROTTLE);
        }
    }

    /// Mark every durable chunk stable and persist the record. Gates the
    /// drop worker: retirement is only final once checkpointed.
    pub fn checkpoint(&self) -> Result<()> {
        {
            let chunks = self.state.chunks.read().unwrap();
            for chunk in chunks.iter() {
                if chunk.is_ondisk() && !chunk.is_stable() && !chunk.is_empty_chunk() {
                    chunk.set_stable();
                }
            }
        }
        self.state
            .stable_gen
            .store(self.state.dsk_gen.load(Ordering::SeqCst), Ordering::SeqCst);
        self.persist_meta()?;
        self.throttle.note_checkpoint();
        if self.throttle.rate_ns() == 0 {
            self.state.clear_flag(state::THROTTLE);
        }
        let _ = self.queues.push(WorkUnit::new(WorkKind::Drop));
        tracing::info!(tree = %self.name, "Checkpointed tree");
        Ok(())
    }

    /// Open Bloom handle for a chunk, loading and caching it on first use.
    /// A missing or unreadable filter only costs the optimization.
    pub fn bloom_for(&self, chunk: &Chunk) -> Result<Option<Arc<BloomFilter>>> {
        if !chunk.has_bloom() {
            return Ok(None);
        }
        if let Some(filter) = self.blooms.read().unwrap().get(&chunk.id()) {
            return Ok(Some(filter.clone()));
        }
        let path = self.config.dir.join(chunk.bloom_uri());
        match BloomFilter::open(&path) {
            Ok(filter) => {
                let filter = Arc::new(filter);
                self.blooms
                    .write()
                    .unwrap()
                    .insert(chunk.id(), filter.clone());
                Ok(Some(filter))
            }
            Err(e) => {
                tracing::warn!(tree = %self.name, chunk = chunk.id(), error = %e, "Bloom filter unreadable, reads fall through");
                Ok(None)
            }
        }
    }

    pub fn cache_bloom(&self, chunk_id: u32, filter: Arc<BloomFilter>) {
        self.blooms.write().unwrap().insert(chunk_id, filter);
    }

    pub fn uncache_bloom(&self, chunk_id: u32) {
        self.blooms.write().unwrap().remove(&chunk_id);
    }
}

/// A write-optimized ordered key-value store: an LSM tree over a chunk
/// store.
pub struct LsmTree {
    pub(crate) inner: Arc<TreeInner>,
    workers: Mutex<Option<WorkerPool>>,
}

impl LsmTree {
    /// Open (or create) a tree backed by the default chunk store and a
    /// fresh transaction clock.
    pub fn open(name: &str, config: TreeConfig) -> Result<Self> {
        let store = Arc::new(MapStore::new(&config.dir)?);
        Self::open_with(name, config, store, Arc::new(TxnManager::new()))
    }

    /// Open with an explicit chunk store and transaction subsystem.
    pub fn open_with(
        name: &str,
        config: TreeConfig,
        store: Arc<dyn ChunkStore>,
        txns: Arc<TxnManager>,
    ) -> Result<Self> {
        config.validate()?;
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return errinput!("invalid tree name {name:?}");
        }
        fs::create_dir_all(&config.dir)?;

        let meta_path = config.dir.join(format!("{name}.meta"));
        let state = TreeState::new();

        if meta_path.exists() {
            restore(name, &meta_path, &state, &*store, &txns)?;
        } else {
            let id = state.next_chunk_id();
            let primary = Arc::new(Chunk::new(name, id));
            store.create(primary.uri())?;
            state.chunks.write().unwrap().push(primary);
        }
        state.set_flag(state::OPEN | state::ACTIVE);

        let inner = Arc::new(TreeInner {
            name: name.to_string(),
            config,
            store,
            txns,
            state,
            queues: WorkQueues::new(),
            throttle: Throttle::new(),
            metrics: TreeMetrics::default(),
            blooms: RwLock::new(HashMap::new()),
            last_merge_progress: AtomicU64::new(0),
            meta_lock: Mutex::new(()),
            meta_path,
        });
        inner.persist_meta()?;
        let pool = WorkerPool::start(&inner)?;

        tracing::info!(
            tree = name,
            chunks = inner.state.chunks.read().unwrap().len(),
            workers = inner.config.workers,
            "Opened LSM tree"
        );
        Ok(Self {
            inner,
            workers: Mutex::new(Some(pool)),
        })
    }

    /// A new session on this tree's transaction subsystem.
    pub fn session(&self) -> Session {
        Session::new(self.inner.txns.clone())
    }

    /// Open a cursor reading at the session's snapshot.
    pub fn open_cursor(&self, session: &Session, config: CursorConfig) -> Result<LsmCursor> {
        if !self.inner.state.has_flag(state::OPEN) {
            return Err(Error::Shutdown);
        }
        let (snapshot, pinned) = session.cursor_snapshot();
        LsmCursor::open(self.inner.clone(), snapshot, pinned, config)
    }

    /// Flush buffered writes and fold the tree into as few chunks as the
    /// merge policy allows, then checkpoint.
    pub fn compact(&self) -> Result<()> {
        if !self.inner.state.has_flag(state::ACTIVE) {
            return Err(Error::Shutdown);
        }
        if !self.inner.state.try_set_flag(state::COMPACTING) {
            return Err(Error::Busy);
        }
        let result = self.compact_inner();
        self.inner.state.clear_flag(state::COMPACTING);
        result
    }

    fn compact_inner(&self) -> Result<()> {
        let inner = &self.inner;
        let deadline = Instant::now() + COMPACT_TIMEOUT;

        // Seal whatever the primary holds and wait until every sealed
        // chunk is durable.
        inner.switch(true)?;
        loop {
            let pending = {
                let chunks = inner.state.chunks.read().unwrap();
                chunks
                    .iter()
                    .any(|c| c.state() == ChunkState::Sealing && !c.is_empty_chunk())
            };
            if !pending {
                break;
            }
            if Instant::now() > deadline {
                return Err(Error::Busy);
            }
            std::thread::sleep(COMPACT_POLL);
        }

        // Drive merges until no window remains and none is in flight.
        loop {
            while merge::plan(inner, true).is_some() {
                let before = inner.state.merge_progressing.load(Ordering::SeqCst);
                inner.queues.push(WorkUnit::forced(WorkKind::Merge))?;
                loop {
                    if inner.state.merge_progressing.load(Ordering::SeqCst) != before {
                        break;
                    }
                    if merge::plan(inner, true).is_none() {
                        break;
                    }
                    if Instant::now() > deadline {
                        return Err(Error::Busy);
                    }
                    std::thread::sleep(COMPACT_POLL);
                }
            }

            loop {
                let merging = {
                    let chunks = inner.state.chunks.read().unwrap();
                    chunks.iter().any(|c| c.state() == ChunkState::Merging)
                };
                if !merging {
                    break;
                }
                if Instant::now() > deadline {
                    return Err(Error::Busy);
                }
                std::thread::sleep(COMPACT_POLL);
            }

            if merge::plan(inner, true).is_none() {
                break;
            }
        }

        inner.checkpoint()?;

        // Hand space reclamation down to the chunk store.
        let sealed: Vec<Arc<Chunk>> = {
            let chunks = inner.state.chunks.read().unwrap();
            chunks.iter().filter(|c| c.is_ondisk()).cloned().collect()
        };
        for chunk in sealed {
            inner.store.compact(chunk.uri())?;
        }

        tracing::info!(tree = %inner.name, "Compacted tree");
        Ok(())
    }

    /// Mark all durable chunks stable and persist the metadata record.
    pub fn checkpoint(&self) -> Result<()> {
        if !self.inner.state.has_flag(state::OPEN) {
            return Err(Error::Shutdown);
        }
        self.inner.checkpoint()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Emit the metric counters and tree shape through tracing.
    pub fn log_metrics(&self) {
        let snapshot = self.inner.metrics.snapshot();
        let nchunks = self.inner.state.chunks.read().unwrap().len();
        let nold = self.inner.state.old_chunks.read().unwrap().len();
        let dsk_gen = self.inner.state.dsk_gen.load(Ordering::SeqCst);
        metrics::log(&self.inner.name, &snapshot, nchunks, nold, dsk_gen);
    }

    /// Check the structural invariants of the active array.
    pub fn validate(&self) -> Result<()> {
        self.inner.state.validate()
    }

    /// Stop workers, flush buffered writes, checkpoint, and drop what can
    /// be dropped. Queued work is discarded; in-flight units observe the
    /// cleared active flag and abort. Idempotent.
    pub fn close(&self) -> Result<()> {
        let Some(pool) = self.workers.lock().unwrap().take() else {
            return Ok(());
        };
        let inner = &self.inner;

        inner.state.clear_flag(state::ACTIVE);
        inner.queues.shutdown();
        pool.join();

        // Seal a non-empty primary so its data reaches disk.
        {
            let chunks = inner.state.chunks.write().unwrap();
            if let Some(primary) = chunks.last().filter(|c| c.is_primary()) {
                let records = inner
                    .store
                    .stat(primary.uri())
                    .map(|s| s.records)
                    .unwrap_or(0);
                if records > 0 {
                    primary.note_writer(inner.txns.current());
                    let _ = primary.transition(ChunkState::Active, ChunkState::Sealing);
                }
            }
        }
        // Flush everything still sealed, including chunks whose queued
        // flush units were just discarded.
        loop {
            let pending = {
                let chunks = inner.state.chunks.read().unwrap();
                chunks
                    .iter()
                    .any(|c| c.state() == ChunkState::Sealing && !c.is_empty_chunk())
            };
            if !pending {
                break;
            }
            worker::flush_work(&self.inner)?;
        }
        inner.checkpoint()?;
        match worker::drop_work(&self.inner) {
            Ok(()) | Err(Error::Busy) => {}
            Err(e) => return Err(e),
        }

        inner.state.clear_flag(state::OPEN);
        tracing::info!(tree = %inner.name, "Closed LSM tree");
        Ok(())
    }

    /// Close the tree and unlink everything it owns: chunk files, Bloom
    /// filters, and the metadata record.
    pub fn drop_tree(self) -> Result<()> {
        self.close()?;
        let inner = &self.inner;

        let mut chunks: Vec<Arc<Chunk>> = inner.state.chunks.write().unwrap().drain(..).collect();
        chunks.extend(inner.state.old_chunks.write().unwrap().drain(..));
        for chunk in chunks {
            inner.store.drop_chunk(chunk.uri())?;
            match fs::remove_file(inner.config.dir.join(chunk.bloom_uri())) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            inner.uncache_bloom(chunk.id());
        }
        fs::remove_file(&inner.meta_path)?;
        tracing::info!(tree = %inner.name, "Dropped LSM tree");
        Ok(())
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Rebuild the active array from the persisted record.
fn restore(
    name: &str,
    meta_path: &std::path::Path,
    state: &TreeState,
    store: &dyn ChunkStore,
    txns: &Arc<TxnManager>,
) -> Result<()> {
    let meta = TreeMeta::read(meta_path)?;
    state.last_id.store(meta.last_id, Ordering::SeqCst);
    txns.advance_to(meta.last_txn);

    let total = meta.chunks.len();
    let mut chunks = Vec::with_capacity(total + 1);
    for (i, record) in meta.chunks.iter().enumerate() {
        let chunk = Arc::new(record.revive(name, i + 1 == total));
        if chunk.is_ondisk() && !chunk.is_empty_chunk() && store.stat(chunk.uri()).is_err() {
            // The record survived but the image did not; keep the
            // descriptor for diagnosis, skip the chunk on reads.
            chunk.mark_empty();
            tracing::error!(tree = name, chunk = chunk.id(), "Chunk image missing on open");
        }
        chunks.push(chunk);
    }

    let resumed = chunks.last().filter(|c| c.is_primary()).cloned();
    match resumed {
        Some(primary) => {
            // The in-memory image died with the process; start it empty.
            match store.create(primary.uri()) {
                Ok(()) | Err(Error::Busy) => {}
                Err(e) => return Err(e),
            }
        }
        None => {
            let id = state.next_chunk_id();
            let primary = Arc::new(Chunk::new(name, id));
            store.create(primary.uri())?;
            chunks.push(primary);
        }
    }

    *state.chunks.write().unwrap() = chunks;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsm::merge;
    use crate::tmpfs::TempDir;
    use crate::BloomPolicy;

    fn test_config(dir: &TempDir) -> TreeConfig {
        TreeConfig::new(dir.path())
            .chunk_size(1024 * 1024)
            .merge_min(2)
            .merge_max(4)
            .bloom(BloomPolicy::Off)
            .workers(2)
    }

    fn open_tree(dir: &TempDir) -> LsmTree {
        LsmTree::open("fires", test_config(dir)).unwrap()
    }

    /// Seal the primary and flush it on this thread.
    fn seal_and_flush(tree: &LsmTree) {
        tree.inner.switch(true).unwrap();
        loop {
            let pending = {
                let chunks = tree.inner.state.chunks.read().unwrap();
                chunks.iter().any(|c| c.state() == ChunkState::Sealing)
            };
            if !pending {
                break;
            }
            worker::flush_work(&tree.inner).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn scan_all(cursor: &mut LsmCursor) -> Vec<(Vec<u8>, Vec<u8>)> {
        cursor.reset().unwrap();
        let mut out = Vec::new();
        while let Some(pair) = cursor.next().unwrap() {
            out.push(pair);
        }
        out
    }

    /// Scenario: basic round trip across a forced switch.
    #[test]
    fn test_round_trip_across_switch() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        for ch in b'a'..=b'm' {
            cursor.insert(&[ch], format!("v{}", ch as char).as_bytes()).unwrap();
        }
        seal_and_flush(&tree);
        for ch in b'n'..=b'z' {
            cursor.insert(&[ch], format!("v{}", ch as char).as_bytes()).unwrap();
        }

        let all = scan_all(&mut cursor);
        assert_eq!(all.len(), 26);
        for (i, (key, value)) in all.iter().enumerate() {
            let ch = b'a' + i as u8;
            assert_eq!(key, &vec![ch]);
            assert_eq!(value, format!("v{}", ch as char).as_bytes());
        }
        tree.close().unwrap();
    }

    /// Scenario: a shadow write is invisible to a snapshot pinned between
    /// the two versions.
    #[test]
    fn test_shadow_write_snapshots() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        cursor.insert(b"k", b"v1").unwrap();
        let pinned = tree.session();
        pinned.pin_snapshot();

        seal_and_flush(&tree);
        cursor.insert(b"k", b"v2").unwrap();

        assert_eq!(cursor.search(b"k").unwrap(), Some(b"v2".to_vec()));

        let mut old = tree.open_cursor(&pinned, CursorConfig::default()).unwrap();
        assert_eq!(old.search(b"k").unwrap(), Some(b"v1".to_vec()));
        tree.close().unwrap();
    }

    /// Scenario: merging sealed chunks preserves every key exactly once.
    #[test]
    fn test_merge_preserves_content() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        for i in 0..10_000u32 {
            cursor
                .insert(format!("key{i:05}").as_bytes(), format!("val{i}").as_bytes())
                .unwrap();
            if i % 2500 == 2499 {
                seal_and_flush(&tree);
            }
        }

        // Background workers may already be merging; either way at least
        // one merge must end up in the counters.
        let merged_now = merge::run(&tree.inner, true).unwrap();
        if !merged_now {
            let mut merged_elsewhere = false;
            for _ in 0..500 {
                if tree.metrics().merges > 0 {
                    merged_elsewhere = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(merged_elsewhere, "expected a merge to happen");
        }

        let all = scan_all(&mut cursor);
        assert_eq!(all.len(), 10_000);
        for (i, (key, _)) in all.iter().enumerate() {
            assert_eq!(key, format!("key{i:05}").as_bytes());
        }
        tree.validate().unwrap();
        tree.close().unwrap();
    }

    /// Scenario: an oldest-touching merge erases both the value and the
    /// tombstone.
    #[test]
    fn test_tombstone_erased_by_oldest_merge() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        cursor.insert(b"x", b"1").unwrap();
        seal_and_flush(&tree);
        cursor.remove(b"x").unwrap();
        seal_and_flush(&tree);

        // A background worker may beat this call to the same window.
        let _ = merge::run(&tree.inner, true).unwrap();
        let merged = {
            let mut found = None;
            for _ in 0..500 {
                let chunks = tree.inner.state.chunks.read().unwrap();
                found = chunks.iter().find(|c| c.generation() > 0).cloned();
                if found.is_some() {
                    break;
                }
                drop(chunks);
                std::thread::sleep(Duration::from_millis(1));
            }
            found.expect("merge output never appeared")
        };

        assert_eq!(cursor.search(b"x").unwrap(), None);
        let stat = tree.inner.store.stat(merged.uri()).unwrap();
        assert_eq!(stat.records, 0);
        tree.close().unwrap();
    }

    /// Scenario: Bloom negatives answer point misses without opening the
    /// sealed chunks' cursors.
    #[test]
    fn test_bloom_negative_short_circuit() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MapStore::new(dir.path()).unwrap());
        // No merges here: the sealed chunks must keep their filters.
        let config = test_config(&dir)
            .bloom(BloomPolicy::Oldest)
            .merge_min(8)
            .merge_max(8);
        let tree =
            LsmTree::open_with("fires", config, store.clone(), Arc::new(TxnManager::new()))
                .unwrap();
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        for i in 0..200u32 {
            cursor.insert(format!("key{i:03}").as_bytes(), b"v").unwrap();
            if i == 99 {
                seal_and_flush(&tree);
            }
        }
        seal_and_flush(&tree);

        // Build filters over both sealed chunks; background workers may
        // already be on it.
        for _ in 0..500 {
            let done = {
                let chunks = tree.inner.state.chunks.read().unwrap();
                chunks.iter().filter(|c| !c.is_primary()).all(|c| c.has_bloom())
            };
            if done {
                break;
            }
            worker::bloom_work(&tree.inner).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        {
            let chunks = tree.inner.state.chunks.read().unwrap();
            assert!(chunks.iter().filter(|c| !c.is_primary()).all(|c| c.has_bloom()));
        }

        // Warm the cursor so the primary sub-cursor exists, then count.
        let mut fresh = tree.open_cursor(&session, CursorConfig::default()).unwrap();
        assert_eq!(fresh.search(b"nope").unwrap(), None);
        let opens_before = store.cursor_opens();
        assert_eq!(fresh.search(b"also-nope").unwrap(), None);
        assert_eq!(store.cursor_opens(), opens_before);

        let metrics = tree.metrics();
        assert!(metrics.bloom_misses >= 4);
        tree.close().unwrap();
    }

    /// Scenario: close drains queued work promptly and nothing is left
    /// mid-merge on re-open.
    #[test]
    fn test_shutdown_with_queued_merges() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        for i in 0..500u32 {
            cursor.insert(format!("k{i:04}").as_bytes(), b"v").unwrap();
            if i % 100 == 99 {
                tree.inner.switch(true).unwrap();
            }
        }
        for _ in 0..100 {
            let _ = tree.inner.queues.push(WorkUnit::new(WorkKind::Merge));
        }
        drop(cursor);
        tree.close().unwrap();

        let tree = open_tree(&dir);
        tree.validate().unwrap();
        {
            let chunks = tree.inner.state.chunks.read().unwrap();
            for chunk in chunks.iter() {
                assert_ne!(chunk.state(), ChunkState::Merging);
            }
        }
        let mut cursor = tree
            .open_cursor(&tree.session(), CursorConfig::default())
            .unwrap();
        let mut count = 0;
        while cursor.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 500);
        tree.close().unwrap();
    }

    /// Property: ids observed across switches are strictly increasing and
    /// exactly one writable chunk sits at the tail.
    #[test]
    fn test_switch_invariants() {
        let dir = TempDir::new().unwrap();
        // Keep merges out of the picture so the creation-order id check
        // holds across the whole run.
        let config = test_config(&dir).merge_min(8).merge_max(8);
        let tree = LsmTree::open("fires", config).unwrap();
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        for round in 0..5u32 {
            cursor.insert(format!("k{round}").as_bytes(), b"v").unwrap();
            seal_and_flush(&tree);

            let chunks = tree.inner.state.chunks.read().unwrap();
            for pair in chunks.windows(2) {
                assert!(pair[0].id() < pair[1].id());
            }
            let primaries = chunks.iter().filter(|c| c.is_primary()).count();
            assert_eq!(primaries, 1);
            assert!(chunks.last().unwrap().is_primary());
        }
        tree.validate().unwrap();
        tree.close().unwrap();
    }

    /// Property: replaying any work unit against a tree that already
    /// applied it is a no-op returning OK.
    #[test]
    fn test_idempotent_work_replay() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        cursor.insert(b"k", b"v").unwrap();
        seal_and_flush(&tree);

        let gen_before = tree.inner.state.dsk_gen.load(Ordering::SeqCst);
        // A switch unit with no pending request does nothing.
        tree.inner.switch(false).unwrap();
        assert_eq!(tree.inner.state.dsk_gen.load(Ordering::SeqCst), gen_before);

        // Replayed flush, bloom, and drop units succeed without effect.
        worker::flush_work(&tree.inner).unwrap();
        worker::bloom_work(&tree.inner).unwrap();
        worker::drop_work(&tree.inner).unwrap();

        assert_eq!(cursor.search(b"k").unwrap(), Some(b"v".to_vec()));
        tree.close().unwrap();
    }

    /// Property: no committed insert is lost across any number of
    /// switches, including a close/re-open cycle.
    #[test]
    fn test_no_lost_updates_across_switches() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        for i in 0..500u32 {
            cursor.insert(format!("k{i:04}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
            if i % 100 == 99 {
                seal_and_flush(&tree);
            }
        }
        for i in 0..500u32 {
            assert_eq!(
                cursor.search(format!("k{i:04}").as_bytes()).unwrap(),
                Some(format!("v{i}").into_bytes()),
            );
        }
        drop(cursor);
        tree.close().unwrap();

        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();
        for i in 0..500u32 {
            assert_eq!(
                cursor.search(format!("k{i:04}").as_bytes()).unwrap(),
                Some(format!("v{i}").into_bytes()),
            );
        }
        tree.close().unwrap();
    }

    /// Retired merge inputs are unlinked only after a checkpoint covers
    /// their retirement.
    #[test]
    fn test_drop_waits_for_checkpoint() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        for i in 0..100u32 {
            cursor.insert(format!("k{i:03}").as_bytes(), b"v").unwrap();
            if i % 50 == 49 {
                seal_and_flush(&tree);
            }
        }
        drop(cursor);
        let _ = merge::run(&tree.inner, true).unwrap();

        // The merge (ours or a worker's) retires its inputs.
        let retired: Vec<String> = {
            let mut uris = Vec::new();
            for _ in 0..500 {
                let old = tree.inner.state.old_chunks.read().unwrap();
                if !old.is_empty() {
                    uris = old.iter().map(|c| c.uri().to_string()).collect();
                    break;
                }
                drop(old);
                std::thread::sleep(Duration::from_millis(1));
            }
            uris
        };
        assert!(!retired.is_empty(), "merge inputs never retired");

        // Before the checkpoint the inputs must survive a drop pass.
        worker::drop_work(&tree.inner).unwrap();
        assert!(!tree.inner.state.old_chunks.read().unwrap().is_empty());
        for uri in &retired {
            assert!(tree.inner.store.stat(uri).is_ok());
        }

        tree.checkpoint().unwrap();
        let mut unlinked = false;
        for _ in 0..500 {
            match worker::drop_work(&tree.inner) {
                Ok(()) | Err(Error::Busy) => {}
                Err(e) => panic!("drop failed: {e}"),
            }
            if tree.inner.state.old_chunks.read().unwrap().is_empty()
                && retired.iter().all(|uri| tree.inner.store.stat(uri).is_err())
            {
                unlinked = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(unlinked, "retired chunks were never unlinked");

        assert!(tree.metrics().drops >= 2);
        tree.close().unwrap();
    }

    /// compact() folds the tree down to one sealed generation and
    /// preserves content.
    #[test]
    fn test_compact_folds_chunks() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        for i in 0..300u32 {
            cursor.insert(format!("k{i:03}").as_bytes(), b"v").unwrap();
            if i % 100 == 99 {
                seal_and_flush(&tree);
            }
        }
        drop(cursor);
        tree.compact().unwrap();

        let sealed = {
            let chunks = tree.inner.state.chunks.read().unwrap();
            chunks.iter().filter(|c| !c.is_primary()).count()
        };
        assert_eq!(sealed, 1, "compact should fold sealed chunks into one");

        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();
        let all = scan_all(&mut cursor);
        assert_eq!(all.len(), 300);
        tree.close().unwrap();
    }

    /// Re-open restores the persisted chunk list and keeps serving reads.
    #[test]
    fn test_reopen_restores_chunk_list() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        cursor.insert(b"a", b"1").unwrap();
        seal_and_flush(&tree);
        cursor.insert(b"b", b"2").unwrap();

        let sealed_before = {
            let chunks = tree.inner.state.chunks.read().unwrap();
            chunks.iter().filter(|c| !c.is_primary()).count()
        };
        drop(cursor);
        tree.close().unwrap();

        let tree = open_tree(&dir);
        let sealed_after = {
            let chunks = tree.inner.state.chunks.read().unwrap();
            chunks.iter().filter(|c| !c.is_primary()).count()
        };
        // Close sealed the buffered primary too.
        assert_eq!(sealed_after, sealed_before + 1);

        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();
        assert_eq!(cursor.search(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(cursor.search(b"b").unwrap(), Some(b"2".to_vec()));
        tree.close().unwrap();
    }

    /// drop_tree unlinks every chunk file, filter, and the metadata
    /// record.
    #[test]
    fn test_drop_tree_unlinks_everything() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        let mut cursor = tree.open_cursor(&session, CursorConfig::default()).unwrap();

        cursor.insert(b"a", b"1").unwrap();
        seal_and_flush(&tree);
        cursor.insert(b"b", b"2").unwrap();
        drop(cursor);

        tree.drop_tree().unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".lsm") || n.ends_with(".bf") || n.ends_with(".meta"))
            .collect();
        assert!(leftovers.is_empty(), "files left behind: {leftovers:?}");
    }

    /// Cursor options reach the tree API: unknown options are rejected.
    #[test]
    fn test_invalid_cursor_options() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        let session = tree.session();
        assert!(matches!(
            CursorConfig::parse("fsync=yes"),
            Err(Error::InvalidInput(_))
        ));
        let config = CursorConfig {
            bulk: true,
            checkpoint: Some("last".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            tree.open_cursor(&session, config),
            Err(Error::InvalidInput(_))
        ));
        tree.close().unwrap();
    }
}
