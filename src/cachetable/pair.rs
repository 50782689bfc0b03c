use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::types::{FullHash, PairKey};

use super::attr::PairAttr;
use super::file::FileShared;
use super::ops::{PageOps, Payload};

/// Saturation point of the per-pair clock counter.
pub(crate) const CLOCK_SATURATION: u8 = 15;

/// Residency state of a pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PairState {
    /// Not resident; the pair has left the index.
    OnDisk,
    /// A fetch is filling the payload.
    Reading,
    /// Resident with parts partially evicted.
    Partial,
    /// Fully resident.
    Available,
    /// A partial eviction is running on the payload.
    PartialEvictionInProgress,
    /// The payload itself is being written.
    Writing,
    /// A checkpoint clone of the payload is being written.
    ClonedWriting,
}

/// Control fields of a pair, guarded by its meta mutex.
pub(crate) struct PairMeta {
    pub key: PairKey,
    pub fullhash: FullHash,
    pub state: PairState,
    pub dirty: bool,
    pub checkpoint_pending: bool,
    pub clock_count: u8,
    pub attr: PairAttr,
    pub clone_in_flight: bool,
    pub removed: bool,
    pub pins: u32,
    pub writer_pinned: bool,
}

impl PairMeta {
    pub fn touch(&mut self) {
        if self.clock_count < CLOCK_SATURATION {
            self.clock_count += 1;
        }
    }

    /// Pinned, mid-I/O or gone: the evictor and cleaner leave it alone.
    pub fn is_busy(&self) -> bool {
        self.removed
            || self.pins > 0
            || self.clone_in_flight
            || !matches!(self.state, PairState::Available | PairState::Partial)
    }
}

/// Cache control block for one page.
///
/// Lock order: `value`, then the checkpoint gate, then the table index, then
/// `meta`. Nothing blocks on `value` while holding the index or `meta`.
pub(crate) struct Pair<P: Payload> {
    pub value: Arc<RwLock<Option<P>>>,
    pub meta: Mutex<PairMeta>,
    pub io_done: Condvar,
    pub file: Arc<FileShared<P>>,
    pub ops: Arc<dyn PageOps<P>>,
    clock_slot: AtomicUsize,
}

impl<P: Payload> Pair<P> {
    pub fn new(
        file: Arc<FileShared<P>>,
        key: PairKey,
        fullhash: FullHash,
        state: PairState,
        payload: Option<P>,
        attr: PairAttr,
    ) -> Arc<Self> {
        let ops = Arc::clone(&file.ops);
        Arc::new(Self {
            value: Arc::new(RwLock::new(payload)),
            meta: Mutex::new(PairMeta {
                key,
                fullhash,
                state,
                dirty: false,
                checkpoint_pending: false,
                clock_count: 0,
                attr,
                clone_in_flight: false,
                removed: false,
                pins: 0,
                writer_pinned: false,
            }),
            io_done: Condvar::new(),
            file,
            ops,
            clock_slot: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn meta(&self) -> MutexGuard<'_, PairMeta> {
        self.meta.lock()
    }

    pub fn key(&self) -> PairKey {
        self.meta.lock().key
    }

    /// Blocks until no clone write of this pair is in flight.
    pub fn wait_for_clone(&self, meta: &mut MutexGuard<'_, PairMeta>) {
        while meta.clone_in_flight {
            self.io_done.wait(meta);
        }
    }

    pub(crate) fn clock_slot(&self) -> usize {
        self.clock_slot.load(Ordering::Relaxed)
    }

    pub(crate) fn set_clock_slot(&self, slot: usize) {
        self.clock_slot.store(slot, Ordering::Relaxed);
    }
}

/// Point-in-time view of one pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairStateInfo {
    /// Residency state.
    pub state: PairState,
    /// Unwritten changes present.
    pub dirty: bool,
    /// Marked by a checkpoint that has not visited the pair yet.
    pub checkpoint_pending: bool,
    /// A checkpoint clone is being written.
    pub clone_in_flight: bool,
    /// Outstanding pins.
    pub pins: u32,
    /// Held exclusively.
    pub writer_pinned: bool,
    /// Clock counter.
    pub clock_count: u8,
    /// Owner-reported attribute.
    pub attr: PairAttr,
}

impl From<&PairMeta> for PairStateInfo {
    fn from(meta: &PairMeta) -> Self {
        Self {
            state: meta.state,
            dirty: meta.dirty,
            checkpoint_pending: meta.checkpoint_pending,
            clone_in_flight: meta.clone_in_flight,
            pins: meta.pins,
            writer_pinned: meta.writer_pinned,
            clock_count: meta.clock_count,
            attr: meta.attr,
        }
    }
}
