//! The worker pool.
//!
//! A fixed set of OS threads drains the work queues. Every worker accepts
//! switches, flushes, Bloom builds, and drops; when the pool has more than
//! one thread the first worker refuses merges, so a long merge can never
//! occupy every thread while a switch is waiting.
//!
//! Transient failures (`Busy`) requeue the unit with a linear backoff and a
//! small retry cap; everything else is logged. Workers re-check the tree's
//! active flag before each unit and at streaming boundaries, so close never
//! waits on more than the unit in flight.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::chunk::{Chunk, ChunkState};
use super::merge;
use super::state;
use super::tree::TreeInner;
use super::work::{WorkKind, WorkMask, WorkUnit};
use crate::bloom::BloomFilter;
use crate::config::BloomPolicy;
use crate::error::{Error, Result};
use crate::store::CursorOptions;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Retries before a transiently failing unit is abandoned.
const MAX_ATTEMPTS: u32 = 20;
/// Streamed operations re-check the shutdown flag this often.
const SHUTDOWN_CHECK_INTERVAL: u64 = 1024;

pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(inner: &Arc<TreeInner>) -> Result<Self> {
        let count = inner.config.workers;
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let mask = if count > 1 && i == 0 {
                WorkMask::all().without(WorkKind::Merge)
            } else {
                WorkMask::all()
            };
            let inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("emberdb-worker-{i}"))
                .spawn(move || worker_loop(inner, mask))?;
            handles.push(handle);
        }
        Ok(Self { handles })
    }

    /// Wait for every worker to observe the shutdown and exit.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: Arc<TreeInner>, mask: WorkMask) {
    loop {
        let unit = match inner.queues.wait_pop(mask, POLL_INTERVAL) {
            Err(_) => break,
            Ok(None) => continue,
            Ok(Some(unit)) => unit,
        };
        let result = execute(&inner, unit);
        inner.queues.complete();
        match result {
            Ok(()) => {}
            Err(Error::Busy) => requeue(&inner, unit),
            Err(Error::Shutdown) => {}
            Err(e) => {
                tracing::error!(tree = %inner.name, op = ?unit.kind, error = %e, "Work unit failed");
            }
        }
    }
}

pub(crate) fn execute(inner: &Arc<TreeInner>, unit: WorkUnit) -> Result<()> {
    if !inner.state.has_flag(state::ACTIVE) {
        return Err(Error::Shutdown);
    }
    match unit.kind {
        WorkKind::Switch => inner.switch(unit.force),
        WorkKind::Flush => flush_work(inner),
        WorkKind::Bloom => bloom_work(inner),
        WorkKind::Merge => merge::run(inner, unit.force).map(|_| ()),
        WorkKind::Drop => drop_work(inner),
    }
}

fn requeue(inner: &Arc<TreeInner>, mut unit: WorkUnit) {
    unit.attempts += 1;
    if unit.attempts > MAX_ATTEMPTS {
        tracing::warn!(
            tree = %inner.name,
            op = ?unit.kind,
            attempts = unit.attempts,
            "Abandoning work unit after repeated contention"
        );
        return;
    }
    inner.metrics.bump(&inner.metrics.requeues);
    thread::sleep(Duration::from_millis(u64::from(unit.attempts.min(10))));
    let _ = inner.queues.push(unit);
}

/// Flush the oldest sealed-but-not-durable chunk. A no-op when none needs
/// it, so replayed units return success.
pub(crate) fn flush_work(inner: &Arc<TreeInner>) -> Result<()> {
    let target = {
        let chunks = inner.state.chunks.read().unwrap();
        let claimed = chunks
            .iter()
            .find(|c| c.state() == ChunkState::Sealing && c.try_claim_flush());
        match claimed {
            Some(chunk) => {
                chunk.refcnt.fetch_add(1, Ordering::SeqCst);
                chunk.clone()
            }
            None => return Ok(()),
        }
    };
    let result = flush_chunk(inner, &target);
    if result.is_err() && !target.is_empty_chunk() {
        // Transient failure: let a retry reclaim the chunk.
        target.unclaim_flush();
    }
    target.refcnt.fetch_sub(1, Ordering::SeqCst);
    result
}

fn flush_chunk(inner: &Arc<TreeInner>, chunk: &Arc<Chunk>) -> Result<()> {
    if let Err(e) = inner.store.checkpoint(chunk.uri()) {
        if let Error::IO(_) | Error::Corrupt(_) = e {
            // The chunk's image is poisoned; leave it in place for
            // diagnosis and keep writers on the fresh primary.
            chunk.mark_empty();
            inner.state.set_flag(state::THROTTLE);
            tracing::error!(tree = %inner.name, chunk = chunk.id(), error = %e, "Chunk flush poisoned");
        }
        return Err(e);
    }

    let stat = inner.store.stat(chunk.uri())?;
    chunk.count.store(stat.records, Ordering::SeqCst);
    chunk.size.store(stat.bytes, Ordering::SeqCst);

    // Another worker may have completed the same flush; that is success.
    if chunk
        .transition(ChunkState::Sealing, ChunkState::OnDisk)
        .is_err()
    {
        return Ok(());
    }

    if inner.store.release(chunk.uri()).is_ok() {
        chunk.mark_evicted();
    }

    inner.metrics.bump(&inner.metrics.flushes);
    inner.persist_meta()?;
    tracing::info!(
        tree = %inner.name,
        chunk = chunk.id(),
        records = stat.records,
        bytes = stat.bytes,
        "Flushed chunk"
    );

    // Best effort: enqueues lost to a concurrent shutdown are recovered
    // by the scans the next units run.
    if inner.config.bloom != BloomPolicy::Off {
        let _ = inner.queues.push(WorkUnit::new(WorkKind::Bloom));
    }
    let _ = inner.queues.push(WorkUnit::new(WorkKind::Merge));
    Ok(())
}

/// Whether the policy wants a filter over this chunk. `oldest` is its
/// position in the active array.
fn wants_bloom(policy: BloomPolicy, chunk: &Chunk, oldest: bool) -> bool {
    match policy {
        BloomPolicy::Off => false,
        BloomPolicy::On => !oldest,
        BloomPolicy::Oldest => true,
        BloomPolicy::Merged => chunk.generation() > 0,
    }
}

/// Build a Bloom filter over the first eligible chunk.
pub(crate) fn bloom_work(inner: &Arc<TreeInner>) -> Result<()> {
    let target = {
        let chunks = inner.state.chunks.read().unwrap();
        // The 0 -> 1 exchange on bloom_busy doubles as the build claim.
        let found = chunks.iter().enumerate().find(|(i, c)| {
            matches!(c.state(), ChunkState::OnDisk)
                && !c.has_bloom()
                && !c.is_empty_chunk()
                && wants_bloom(inner.config.bloom, c, *i == 0)
                && c.bloom_busy
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
        });
        match found {
            Some((_, chunk)) => chunk.clone(),
            None => return Ok(()),
        }
    };
    let result = build_bloom(inner, &target);
    target.bloom_busy.fetch_sub(1, Ordering::SeqCst);
    result
}

fn build_bloom(inner: &Arc<TreeInner>, chunk: &Arc<Chunk>) -> Result<()> {
    let count = chunk.count.load(Ordering::SeqCst);
    if count == 0 {
        return Ok(());
    }

    let mut filter = BloomFilter::new(
        count,
        inner.config.bloom_bit_count,
        inner.config.bloom_hash_count,
    );
    let mut cursor = inner
        .store
        .open_cursor(chunk.uri(), CursorOptions::default())?;
    let mut streamed = 0u64;
    while cursor.next()? {
        filter.insert(cursor.key()?);
        streamed += 1;
        if streamed % SHUTDOWN_CHECK_INTERVAL == 0 && !inner.state.has_flag(state::ACTIVE) {
            return Err(Error::Shutdown);
        }
    }

    let path = inner.config.dir.join(chunk.bloom_uri());
    filter.write_to(&path)?;
    inner.cache_bloom(chunk.id(), Arc::new(filter));
    chunk.set_bloom();
    // The chunk may have been claimed by a merge meanwhile; the filter is
    // still valid, only the state tag stays put.
    let _ = chunk.transition(ChunkState::OnDisk, ChunkState::Bloomed);

    inner.metrics.bump(&inner.metrics.blooms);
    inner.persist_meta()?;
    tracing::info!(
        tree = %inner.name,
        chunk = chunk.id(),
        keys = streamed,
        "Built Bloom filter"
    );
    Ok(())
}

/// Unlink retired chunks no reader or filter build still references, once
/// a checkpoint has made their retirement durable.
pub(crate) fn drop_work(inner: &Arc<TreeInner>) -> Result<()> {
    let stable_gen = inner.state.stable_gen.load(Ordering::SeqCst);
    let ready: Vec<Arc<Chunk>> = {
        let mut old = inner.state.old_chunks.write().unwrap();
        let (ready, keep) = old.drain(..).partition(|c: &Arc<Chunk>| {
            c.refcnt.load(Ordering::SeqCst) == 0
                && c.bloom_busy.load(Ordering::SeqCst) == 0
                && c.retire_gen() <= stable_gen
        });
        *old = keep;
        ready
    };

    let mut failed = Vec::new();
    for chunk in ready {
        let dropped = inner.store.drop_chunk(chunk.uri()).and_then(|()| {
            match std::fs::remove_file(inner.config.dir.join(chunk.bloom_uri())) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        });
        match dropped {
            Ok(()) => {
                inner.uncache_bloom(chunk.id());
                inner.metrics.bump(&inner.metrics.drops);
                tracing::info!(tree = %inner.name, chunk = chunk.id(), "Dropped retired chunk");
            }
            Err(e) => {
                tracing::warn!(tree = %inner.name, chunk = chunk.id(), error = %e, "Chunk drop failed, will retry");
                failed.push(chunk);
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        inner.state.old_chunks.write().unwrap().extend(failed);
        Err(Error::Busy)
    }
}
