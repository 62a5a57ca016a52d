//! The LSM tree engine.
//!
//! A write-optimized, ordered key-value store built as a sequence of
//! chunks: immutable on-disk tables plus one mutable in-memory primary,
//! all owned by an external chunk store and merged behind the scenes by a
//! worker pool.
//!
//! # Architecture
//!
//! ```text
//!  writers ──► LsmCursor ──► primary chunk (mutable, in memory)
//!                                 │ switch: seal + install fresh primary
//!                                 ▼
//!              ┌────────┬────────┬────────┐
//!              │ chunk 1│ chunk 2│ chunk 3│   sealed, immutable,
//!              │ (+bloom)│(+bloom)│(+bloom)│  flushed to disk
//!              └────────┴────────┴────────┘
//!                                 │ merge: k contiguous chunks
//!                                 ▼
//!                        ┌────────────────┐
//!                        │ chunk 4, gen+1 │
//!                        └────────────────┘
//! ```
//!
//! # Data Flow
//!
//! ## Write path
//! 1. Updates land in the primary chunk through a cursor
//! 2. A full primary is sealed by a **switch** and a fresh one installed
//! 3. A worker **flushes** the sealed chunk to durable storage
//! 4. A worker builds a **Bloom** filter over the sealed chunk
//! 5. Workers **merge** contiguous sealed chunks into higher generations
//! 6. Retired merge inputs are **dropped** once unreferenced and
//!    checkpointed
//!
//! ## Read path
//! Cursors capture the chunk array at open, then merge-iterate one
//! sub-cursor per chunk, newest first, under the session's snapshot.
//! Bloom filters short-circuit point lookups on sealed chunks.
//!
//! # Concurrency
//!
//! The tree's read-write lock guards the chunk array; `dsk_gen` tells
//! cursors when their captured view went stale. Three FIFO work queues
//! (switch / app / merge) feed a fixed pool of worker threads, keeping
//! switches ahead of flushes and flushes ahead of merges. Write pressure
//! is absorbed by checkpoint and merge throttles charged in the cursor's
//! update path.

pub mod chunk;
pub mod cursor;
pub mod merge;
pub mod meta;
pub mod metrics;
pub mod state;
pub mod throttle;
pub mod tree;
pub mod work;
pub mod worker;

pub use chunk::{Chunk, ChunkState};
pub use cursor::{CursorConfig, LsmCursor};
pub use metrics::MetricsSnapshot;
pub use tree::LsmTree;
