//! The merge engine.
//!
//! Merges fuse a contiguous window of sealed chunks into one chunk of the
//! next generation, bounding the number of tables a read has to visit.
//! Selection scans the active array (excluding the primary) for the best
//! window of `merge_min..=merge_max` chunks; scoring favors uniform
//! generation, wider windows, and older chunks. When merges stall while
//! chunks keep accumulating, the tree's aggressiveness rises, which widens
//! the tolerated generation spread so the engine does larger, rarer merges
//! instead of giving up.
//!
//! Execution marks the window `Merging` under the write lock, streams it
//! through a read-only merge cursor with no lock held, bulk-loads the
//! result, and swaps the window atomically. A failed load discards the
//! partial output and rolls the window back; no chunk state is lost.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::chunk::{Chunk, ChunkState};
use super::cursor::LsmCursor;
use super::tree::TreeInner;
use super::work::{WorkKind, WorkUnit};
use crate::config::{BloomPolicy, TreeConfig};
use crate::errcorrupt;
use crate::error::{Error, Result};

/// Aggressiveness stops climbing here; each level widens the allowed
/// generation spread by one.
const MAX_AGGRESSIVENESS: u32 = 10;

#[derive(Debug)]
pub(crate) struct MergePlan {
    pub chunks: Vec<Arc<Chunk>>,
    pub generation: u32,
    /// The window touches the oldest chunk, so tombstones can be dropped.
    pub includes_oldest: bool,
}

impl MergePlan {
    fn ids(&self) -> Vec<u32> {
        self.chunks.iter().map(|c| c.id()).collect()
    }
}

fn mergeable(chunk: &Chunk) -> bool {
    matches!(chunk.state(), ChunkState::OnDisk | ChunkState::Bloomed) && !chunk.is_empty_chunk()
}

/// Pick the best merge window, if any. `force` (from compact) relaxes the
/// minimum width to 2.
pub(crate) fn plan(inner: &TreeInner, force: bool) -> Option<MergePlan> {
    let chunks = inner.state.chunks.read().unwrap();
    let aggressiveness = inner.state.merge_aggressiveness.load(Ordering::SeqCst);
    plan_window(&chunks, &inner.config, aggressiveness, force)
}

fn plan_window(
    chunks: &[Arc<Chunk>],
    config: &TreeConfig,
    aggressiveness: u32,
    force: bool,
) -> Option<MergePlan> {
    let min = if force { 2 } else { config.merge_min } as usize;
    let max = config.merge_max as usize;
    let spread_allowed = 1 + aggressiveness;

    let mut best: Option<(u64, usize, usize)> = None; // (score, start, width)
    for start in 0..chunks.len() {
        for width in min..=max {
            let end = start + width;
            if end > chunks.len() {
                break;
            }
            let window = &chunks[start..end];
            if !window.iter().all(|c| mergeable(c)) {
                break;
            }

            let lo = window.iter().map(|c| c.generation()).min().unwrap();
            let hi = window.iter().map(|c| c.generation()).max().unwrap();
            if hi - lo > spread_allowed {
                continue;
            }

            let uniform = if hi == lo { 8 } else { 0 };
            let age = (chunks.len() - start) as u64;
            let score = (width as u64) * 4 + uniform + age;
            if best.map_or(true, |(s, _, _)| score > s) {
                best = Some((score, start, width));
            }
        }
    }

    best.map(|(_, start, width)| {
        let window = &chunks[start..start + width];
        MergePlan {
            chunks: window.to_vec(),
            generation: 1 + window.iter().map(|c| c.generation()).max().unwrap(),
            includes_oldest: start == 0,
        }
    })
}

/// Adapts the merge cursor's record stream for the bulk loader, dropping
/// tombstones when the window touches the oldest chunk.
struct MergeStream<'a> {
    cursor: &'a mut LsmCursor,
    drop_tombstones: bool,
}

impl Iterator for MergeStream<'_> {
    type Item = Result<(Vec<u8>, crate::store::Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.cursor.next_record() {
                Err(e) => return Some(Err(e)),
                Ok(None) => return None,
                Ok(Some((_, record))) if self.drop_tombstones && record.value.is_none() => continue,
                Ok(Some(item)) => return Some(Ok(item)),
            }
        }
    }
}

/// Run one merge if a window is available. Returns whether a merge
/// happened.
pub(crate) fn run(inner: &Arc<TreeInner>, force: bool) -> Result<bool> {
    let Some(plan) = plan(inner, force) else {
        raise_aggressiveness_if_behind(inner);
        return Ok(false);
    };

    if !mark_merging(inner, &plan)? {
        return Ok(false);
    }

    let span = plan.ids();
    tracing::info!(
        tree = %inner.name,
        chunks = ?span,
        generation = plan.generation,
        drop_tombstones = plan.includes_oldest,
        "Starting chunk merge"
    );

    let mut source = match LsmCursor::for_merge(inner.clone(), plan.chunks.clone(), !plan.includes_oldest) {
        Ok(cursor) => cursor,
        Err(e) => {
            unmark_merging(&plan);
            return Err(e);
        }
    };

    let output = Arc::new(Chunk::merged(
        &inner.name,
        inner.state.next_chunk_id(),
        plan.generation,
    ));

    let loaded = load_output(inner, &mut source, &output, plan.includes_oldest);
    drop(source);
    if let Err(e) = loaded {
        // Discard the partial output and put the window back.
        let _ = inner.store.drop_chunk(output.uri());
        unmark_merging(&plan);
        tracing::error!(tree = %inner.name, error = %e, "Chunk merge failed, window restored");
        return Err(e);
    }

    install_output(inner, &plan, &output)?;

    inner.state.merge_progressing.fetch_add(1, Ordering::SeqCst);
    inner.state.merge_aggressiveness.store(0, Ordering::SeqCst);
    inner.throttle.note_merge();
    inner.metrics.bump(&inner.metrics.merges);
    inner.persist_meta()?;

    let _ = inner.queues.push(WorkUnit::new(WorkKind::Drop));
    if inner.config.bloom != BloomPolicy::Off {
        let _ = inner.queues.push(WorkUnit::new(WorkKind::Bloom));
    }

    tracing::info!(
        tree = %inner.name,
        chunks = ?span,
        output = output.id(),
        records = output.count.load(Ordering::SeqCst),
        "Completed chunk merge"
    );
    Ok(true)
}

/// Re-validate the plan's window under the write lock and mark it Merging.
/// Returns false if the array moved underneath the plan.
fn mark_merging(inner: &TreeInner, plan: &MergePlan) -> Result<bool> {
    let chunks = inner.state.chunks.write().unwrap();
    let ids = plan.ids();
    let Some(start) = chunks.iter().position(|c| c.id() == ids[0]) else {
        return Ok(false);
    };
    let window: Vec<u32> = chunks
        .iter()
        .skip(start)
        .take(ids.len())
        .map(|c| c.id())
        .collect();
    if window != ids {
        return Ok(false);
    }

    for (n, chunk) in plan.chunks.iter().enumerate() {
        let from = if chunk.has_bloom() {
            ChunkState::Bloomed
        } else {
            ChunkState::OnDisk
        };
        if chunk.transition(from, ChunkState::Merging).is_err() {
            for prior in &plan.chunks[..n] {
                unmark_one(prior);
            }
            return Ok(false);
        }
    }
    Ok(true)
}

fn unmark_one(chunk: &Chunk) {
    let to = if chunk.has_bloom() {
        ChunkState::Bloomed
    } else {
        ChunkState::OnDisk
    };
    let _ = chunk.transition(ChunkState::Merging, to);
}

fn unmark_merging(plan: &MergePlan) {
    for chunk in &plan.chunks {
        unmark_one(chunk);
    }
}

/// Stream the window into the output chunk and make it durable.
fn load_output(
    inner: &Arc<TreeInner>,
    source: &mut LsmCursor,
    output: &Chunk,
    drop_tombstones: bool,
) -> Result<()> {
    let mut stream = MergeStream {
        cursor: source,
        drop_tombstones,
    };
    inner.store.bulk_load(output.uri(), &mut stream)?;
    inner.store.checkpoint(output.uri())?;

    let stat = inner.store.stat(output.uri())?;
    output.count.store(stat.records, Ordering::SeqCst);
    output.size.store(stat.bytes, Ordering::SeqCst);
    if stat.records == 0 {
        output.mark_empty();
    }
    Ok(())
}

/// Atomically replace the window with the output and retire the inputs.
fn install_output(inner: &Arc<TreeInner>, plan: &MergePlan, output: &Arc<Chunk>) -> Result<()> {
    // The output answers for every transaction its inputs answered for.
    let stamp = plan
        .chunks
        .iter()
        .map(|c| c.switch_txn.load(Ordering::SeqCst))
        .max()
        .unwrap_or(0);
    output.switch_txn.store(stamp, Ordering::SeqCst);

    let mut chunks = inner.state.chunks.write().unwrap();
    let ids = plan.ids();
    let start = chunks
        .iter()
        .position(|c| c.id() == ids[0])
        .ok_or_else(|| Error::Corrupt("merge window vanished during merge".into()))?;
    chunks.splice(start..start + ids.len(), [output.clone()]);

    let dsk_gen = inner.state.bump_dsk_gen();
    let mut old = inner.state.old_chunks.write().unwrap();
    for chunk in &plan.chunks {
        if chunk
            .transition(ChunkState::Merging, ChunkState::Retired)
            .is_err()
        {
            return errcorrupt!("merge input {} left Merging prematurely", chunk.id());
        }
        chunk.set_retire_gen(dsk_gen);
        old.push(chunk.clone());
    }
    Ok(())
}

/// No window found: if sealed chunks have piled up past the widest merge
/// while nothing is progressing, widen the net for the next attempt.
fn raise_aggressiveness_if_behind(inner: &TreeInner) {
    let sealed = {
        let chunks = inner.state.chunks.read().unwrap();
        chunks.iter().filter(|c| !c.is_primary()).count()
    };
    if sealed > inner.config.merge_max as usize {
        let current = inner.state.merge_aggressiveness.load(Ordering::SeqCst);
        if current < MAX_AGGRESSIVENESS {
            inner
                .state
                .merge_aggressiveness
                .store(current + 1, Ordering::SeqCst);
            tracing::warn!(
                tree = %inner.name,
                sealed_chunks = sealed,
                aggressiveness = current + 1,
                "Merges falling behind, widening merge selection"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(id: u32, generation: u32) -> Arc<Chunk> {
        Arc::new(Chunk::with_state("t", id, generation, ChunkState::OnDisk))
    }

    fn config() -> TreeConfig {
        TreeConfig::default().merge_min(2).merge_max(4)
    }

    #[test]
    fn test_no_window_when_too_few_chunks() {
        let chunks = vec![sealed(1, 0), Arc::new(Chunk::new("t", 2))];
        assert!(plan_window(&chunks, &config(), 0, false).is_none());
    }

    #[test]
    fn test_prefers_uniform_generation_and_width() {
        // Four gen-0 chunks and one gen-2: the gen-0 run wins.
        let chunks = vec![
            sealed(1, 2),
            sealed(2, 0),
            sealed(3, 0),
            sealed(4, 0),
            sealed(5, 0),
            Arc::new(Chunk::new("t", 6)),
        ];
        let plan = plan_window(&chunks, &config(), 0, false).unwrap();
        let ids: Vec<u32> = plan.chunks.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![2, 3, 4, 5]);
        assert_eq!(plan.generation, 1);
        assert!(!plan.includes_oldest);
    }

    #[test]
    fn test_prefers_older_window_on_tie() {
        let chunks = vec![
            sealed(1, 0),
            sealed(2, 0),
            sealed(3, 0),
            sealed(4, 0),
            sealed(5, 0),
            sealed(6, 0),
        ];
        let cfg = TreeConfig::default().merge_min(3).merge_max(3);
        let plan = plan_window(&chunks, &cfg, 0, false).unwrap();
        let ids: Vec<u32> = plan.chunks.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(plan.includes_oldest);
    }

    #[test]
    fn test_generation_spread_gate() {
        // Adjacent generations merge; a two-generation gap needs
        // aggressiveness.
        let chunks = vec![sealed(1, 2), sealed(2, 0), sealed(3, 0)];
        let cfg = TreeConfig::default().merge_min(3).merge_max(3);
        assert!(plan_window(&chunks, &cfg, 0, false).is_none());

        let plan = plan_window(&chunks, &cfg, 1, false).unwrap();
        assert_eq!(plan.generation, 3);
        assert!(plan.includes_oldest);
    }

    #[test]
    fn test_skips_merging_and_primary_chunks() {
        let busy = sealed(2, 0);
        busy.transition(ChunkState::OnDisk, ChunkState::Merging)
            .unwrap();
        let chunks = vec![
            sealed(1, 0),
            busy,
            sealed(3, 0),
            sealed(4, 0),
            Arc::new(Chunk::new("t", 5)),
        ];
        let plan = plan_window(&chunks, &config(), 0, false).unwrap();
        let ids: Vec<u32> = plan.chunks.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_force_relaxes_minimum() {
        let chunks = vec![sealed(1, 0), sealed(2, 0), Arc::new(Chunk::new("t", 3))];
        let cfg = TreeConfig::default().merge_min(4).merge_max(4);
        assert!(plan_window(&chunks, &cfg, 0, false).is_none());
        assert!(plan_window(&chunks, &cfg, 0, true).is_some());
    }
}
