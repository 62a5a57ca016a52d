//! Transaction clock and snapshot visibility.
//!
//! The host transaction subsystem is modeled as a single monotonically
//! increasing clock. Every committed write carries the transaction id it was
//! assigned; a snapshot captures the clock at a point in time and considers a
//! write visible iff its id is at or below that point. The LSM engine only
//! depends on this contract, never on the clock's internals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Transaction id reserved for "no transaction".
pub const TXN_NONE: u64 = 0;

/// Monotonic transaction id allocator shared by all sessions of a tree.
#[derive(Debug, Default)]
pub struct TxnManager {
    clock: AtomicU64,
}

impl TxnManager {
    pub fn new() -> Self {
        Self {
            clock: AtomicU64::new(TXN_NONE),
        }
    }

    /// The most recently allocated transaction id.
    pub fn current(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Allocate the next transaction id.
    pub fn allocate(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Capture a snapshot of everything committed so far.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            high: self.current(),
        }
    }

    /// Fast-forward the clock past ids recovered from disk, so new writes
    /// never collide with persisted ones.
    pub fn advance_to(&self, txnid: u64) {
        self.clock.fetch_max(txnid, Ordering::SeqCst);
    }
}

/// A point-in-time visibility boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    high: u64,
}

impl Snapshot {
    /// Whether a write with the given transaction id is visible.
    pub fn visible(&self, txnid: u64) -> bool {
        txnid != TXN_NONE && txnid <= self.high
    }

    /// The newest transaction id this snapshot can see.
    pub fn high(&self) -> u64 {
        self.high
    }
}

/// A caller's handle on the transaction subsystem. Cursors opened through a
/// session read at the session's snapshot: the pinned one if set, otherwise a
/// fresh snapshot per cursor open.
pub struct Session {
    txns: Arc<TxnManager>,
    pinned: Mutex<Option<Snapshot>>,
}

impl Session {
    pub fn new(txns: Arc<TxnManager>) -> Self {
        Self {
            txns,
            pinned: Mutex::new(None),
        }
    }

    /// Pin the session to a snapshot of everything committed so far.
    pub fn pin_snapshot(&self) -> Snapshot {
        let snapshot = self.txns.snapshot();
        *self.pinned.lock().unwrap() = Some(snapshot);
        snapshot
    }

    /// Release a pinned snapshot; subsequent reads see latest state.
    pub fn release_snapshot(&self) {
        *self.pinned.lock().unwrap() = None;
    }

    /// The snapshot a cursor opened now should read at.
    pub fn read_snapshot(&self) -> Snapshot {
        self.pinned
            .lock()
            .unwrap()
            .unwrap_or_else(|| self.txns.snapshot())
    }

    /// The snapshot for a new cursor, and whether it is pinned. Unpinned
    /// cursors track the latest committed state as the session writes.
    pub fn cursor_snapshot(&self) -> (Snapshot, bool) {
        match *self.pinned.lock().unwrap() {
            Some(snapshot) => (snapshot, true),
            None => (self.txns.snapshot(), false),
        }
    }

    pub fn txns(&self) -> &Arc<TxnManager> {
        &self.txns
    }
}
