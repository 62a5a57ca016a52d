//! Work units and the queue manager.
//!
//! Three FIFO queues feed the worker pool. Switches get their own queue
//! because a stalled switch stalls every writer; application-requested work
//! (flushes, Bloom builds, drops) gets the second; long-running merges get
//! the third. Workers scan switch, then app, then merge, taking the first
//! unit whose kind they accept, so a flood of merges can never starve a
//! switch or a flush.
//!
//! A single condition variable covers all three queues and is notified on
//! every enqueue. Waits are bounded so workers re-check the shutdown flag
//! even on an idle tree.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};

/// What a unit does. The force modifier is a separate field on the unit,
/// never folded into the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Switch,
    Flush,
    Bloom,
    Merge,
    Drop,
}

impl WorkKind {
    fn bit(self) -> u8 {
        match self {
            WorkKind::Switch => 0x01,
            WorkKind::Flush => 0x02,
            WorkKind::Bloom => 0x04,
            WorkKind::Merge => 0x08,
            WorkKind::Drop => 0x10,
        }
    }
}

/// Operation classes a worker accepts.
#[derive(Debug, Clone, Copy)]
pub struct WorkMask(u8);

impl WorkMask {
    pub fn all() -> Self {
        Self(0x1f)
    }

    pub fn without(self, kind: WorkKind) -> Self {
        Self(self.0 & !kind.bit())
    }

    pub fn accepts(self, kind: WorkKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkUnit {
    pub kind: WorkKind,
    pub force: bool,
    /// Retries so far; drives the requeue backoff.
    pub attempts: u32,
}

impl WorkUnit {
    pub fn new(kind: WorkKind) -> Self {
        Self {
            kind,
            force: false,
            attempts: 0,
        }
    }

    pub fn forced(kind: WorkKind) -> Self {
        Self {
            kind,
            force: true,
            attempts: 0,
        }
    }
}

pub struct WorkQueues {
    switch: Mutex<VecDeque<WorkUnit>>,
    app: Mutex<VecDeque<WorkUnit>>,
    merge: Mutex<VecDeque<WorkUnit>>,

    idle: Mutex<()>,
    work_cond: Condvar,

    shutdown: AtomicBool,
    /// Units pushed but not yet completed.
    pending: AtomicU32,
}

impl WorkQueues {
    pub fn new() -> Self {
        Self {
            switch: Mutex::new(VecDeque::new()),
            app: Mutex::new(VecDeque::new()),
            merge: Mutex::new(VecDeque::new()),
            idle: Mutex::new(()),
            work_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            pending: AtomicU32::new(0),
        }
    }

    fn queue_for(&self, kind: WorkKind) -> &Mutex<VecDeque<WorkUnit>> {
        match kind {
            WorkKind::Switch => &self.switch,
            WorkKind::Merge => &self.merge,
            WorkKind::Flush | WorkKind::Bloom | WorkKind::Drop => &self.app,
        }
    }

    pub fn push(&self, unit: WorkUnit) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        self.queue_for(unit.kind).lock().unwrap().push_back(unit);
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _idle = self.idle.lock().unwrap();
        self.work_cond.notify_all();
        Ok(())
    }

    /// Take the first queued unit this mask accepts, scanning switch, then
    /// app, then merge.
    pub fn pop(&self, mask: WorkMask) -> Option<WorkUnit> {
        for queue in [&self.switch, &self.app, &self.merge] {
            let mut queue = queue.lock().unwrap();
            if let Some(at) = queue.iter().position(|u| mask.accepts(u.kind)) {
                return queue.remove(at);
            }
        }
        None
    }

    /// Block until a unit is available, the timeout elapses, or shutdown.
    ///
    /// The idle lock is held across the empty-check so an enqueue between
    /// the check and the wait cannot slip past unnoticed.
    pub fn wait_pop(&self, mask: WorkMask, timeout: Duration) -> Result<Option<WorkUnit>> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        let idle = self.idle.lock().unwrap();
        if let Some(unit) = self.pop(mask) {
            return Ok(Some(unit));
        }
        let (_idle, _timeout) = self.work_cond.wait_timeout(idle, timeout).unwrap();
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        Ok(self.pop(mask))
    }

    /// A popped unit finished (or was abandoned).
    pub fn complete(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Refuse new work, discard queued units, and wake every waiter.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for queue in [&self.switch, &self.app, &self.merge] {
            let mut queue = queue.lock().unwrap();
            let dropped = queue.len() as u32;
            queue.clear();
            self.pending.fetch_sub(dropped, Ordering::SeqCst);
        }
        let _idle = self.idle.lock().unwrap();
        self.work_cond.notify_all();
    }
}

impl Default for WorkQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let queues = WorkQueues::new();
        queues.push(WorkUnit::new(WorkKind::Merge)).unwrap();
        queues.push(WorkUnit::new(WorkKind::Flush)).unwrap();
        queues.push(WorkUnit::new(WorkKind::Switch)).unwrap();

        let mask = WorkMask::all();
        assert_eq!(queues.pop(mask).unwrap().kind, WorkKind::Switch);
        assert_eq!(queues.pop(mask).unwrap().kind, WorkKind::Flush);
        assert_eq!(queues.pop(mask).unwrap().kind, WorkKind::Merge);
        assert!(queues.pop(mask).is_none());
    }

    #[test]
    fn test_fifo_within_queue() {
        let queues = WorkQueues::new();
        queues.push(WorkUnit::new(WorkKind::Flush)).unwrap();
        queues.push(WorkUnit::new(WorkKind::Drop)).unwrap();
        queues.push(WorkUnit::new(WorkKind::Bloom)).unwrap();

        let mask = WorkMask::all();
        assert_eq!(queues.pop(mask).unwrap().kind, WorkKind::Flush);
        assert_eq!(queues.pop(mask).unwrap().kind, WorkKind::Drop);
        assert_eq!(queues.pop(mask).unwrap().kind, WorkKind::Bloom);
    }

    #[test]
    fn test_mask_skips_unaccepted() {
        let queues = WorkQueues::new();
        queues.push(WorkUnit::new(WorkKind::Bloom)).unwrap();
        queues.push(WorkUnit::new(WorkKind::Drop)).unwrap();

        let no_bloom = WorkMask::all().without(WorkKind::Bloom);
        assert_eq!(queues.pop(no_bloom).unwrap().kind, WorkKind::Drop);
        // The bloom unit is still there for a worker that takes it.
        assert_eq!(queues.pop(WorkMask::all()).unwrap().kind, WorkKind::Bloom);
    }

    #[test]
    fn test_merges_never_block_switches() {
        let queues = WorkQueues::new();
        for _ in 0..10 {
            queues.push(WorkUnit::new(WorkKind::Merge)).unwrap();
        }
        queues.push(WorkUnit::new(WorkKind::Switch)).unwrap();
        assert_eq!(queues.pop(WorkMask::all()).unwrap().kind, WorkKind::Switch);
    }

    #[test]
    fn test_shutdown_drains_and_refuses() {
        let queues = WorkQueues::new();
        queues.push(WorkUnit::new(WorkKind::Merge)).unwrap();
        queues.push(WorkUnit::new(WorkKind::Flush)).unwrap();
        assert_eq!(queues.pending(), 2);

        queues.shutdown();
        assert_eq!(queues.pending(), 0);
        assert!(queues.pop(WorkMask::all()).is_none());
        assert_eq!(
            queues.push(WorkUnit::new(WorkKind::Switch)),
            Err(Error::Shutdown)
        );
        assert_eq!(
            queues.wait_pop(WorkMask::all(), Duration::from_millis(1)),
            Err(Error::Shutdown)
        );
    }

    #[test]
    fn test_wait_pop_times_out_idle() {
        let queues = WorkQueues::new();
        let got = queues
            .wait_pop(WorkMask::all(), Duration::from_millis(5))
            .unwrap();
        assert!(got.is_none());
    }
}
