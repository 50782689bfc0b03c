//! Contract between the cache and the owners of the pages it holds.

use crate::error::{CacheError, Result};
use crate::primitives::io::FileIo;
use crate::types::{FullHash, PageId};

use super::attr::PairAttr;
use super::guard::PinGuard;

/// Page loaded by [`PageOps::fetch`].
pub struct Fetched<P> {
    /// The in-memory page.
    pub payload: P,
    /// Its size and shape.
    pub attr: PairAttr,
    /// Whether the page must be written back even though nothing touched it.
    pub dirty: bool,
}

impl<P> Fetched<P> {
    /// A clean page.
    pub fn clean(payload: P, attr: PairAttr) -> Self {
        Self {
            payload,
            attr,
            dirty: false,
        }
    }
}

/// Flags passed to [`PageOps::flush`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushRequest {
    /// Persist the payload.
    pub write: bool,
    /// The payload stays resident after the call; when false the cache drops
    /// it right after the callback returns.
    pub keep: bool,
    /// The write satisfies a checkpoint obligation.
    pub for_checkpoint: bool,
    /// The payload is a checkpoint clone, not the resident page.
    pub is_clone: bool,
}

impl FlushRequest {
    pub(crate) fn evict(dirty: bool, for_checkpoint: bool) -> Self {
        Self {
            write: dirty,
            keep: false,
            for_checkpoint,
            is_clone: false,
        }
    }

    pub(crate) fn checkpoint_in_place() -> Self {
        Self {
            write: true,
            keep: true,
            for_checkpoint: true,
            is_clone: false,
        }
    }

    pub(crate) fn checkpoint_clone() -> Self {
        Self {
            write: true,
            keep: false,
            for_checkpoint: true,
            is_clone: true,
        }
    }
}

/// How expensive a partial eviction would be.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PartialEvictionCost {
    /// Done inline by the evicting thread.
    Cheap,
    /// Handed to the worker pool.
    Expensive,
}

/// Bound shared by every page type the cache can hold.
pub trait Payload: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Payload for T {}

/// Callbacks implemented once per page type.
///
/// Callbacks run with the pair locked exclusively (or, for clone writes, with
/// no lock at all) and must not pin pages of the same table.
pub trait PageOps<P: Payload>: Send + Sync + 'static {
    /// Loads `page_id` from `io`.
    fn fetch(&self, io: &dyn FileIo, page_id: PageId, fullhash: FullHash) -> Result<Fetched<P>>;

    /// Persists (if `req.write`) and releases (if `!req.keep`) `payload`.
    /// Returns the attribute after the call.
    fn flush(
        &self,
        io: &dyn FileIo,
        page_id: PageId,
        payload: &mut P,
        attr: PairAttr,
        req: FlushRequest,
    ) -> Result<PairAttr>;

    /// Produces an independent snapshot for checkpoint writeback. `None` means
    /// the page type cannot be cloned and checkpoint writes happen in place.
    fn clone_for_checkpoint(&self, _payload: &P) -> Option<(P, PairAttr)> {
        None
    }

    /// Bytes a partial eviction would free, and its cost. Zero disables it.
    fn partial_eviction_estimate(&self, _payload: &P) -> (u64, PartialEvictionCost) {
        (0, PartialEvictionCost::Cheap)
    }

    /// Shrinks `payload` in place; returns the new attribute.
    fn partial_eviction(&self, _payload: &mut P, attr: PairAttr, _bytes_to_free: u64) -> Result<PairAttr> {
        Ok(attr)
    }

    /// True when `payload` is missing parts a caller needs.
    fn partial_fetch_required(&self, _payload: &P) -> bool {
        false
    }

    /// Reads the missing parts of `payload`; returns the new attribute.
    fn partial_fetch(&self, _io: &dyn FileIo, _page_id: PageId, _payload: &mut P) -> Result<PairAttr> {
        Err(CacheError::Invalid("page type does not support partial fetch"))
    }

    /// Opportunistic maintenance on a page the cleaner pinned exclusively.
    /// The callback owns the pin and releases it by dropping or unpinning
    /// the guard.
    fn cleaner(&self, guard: PinGuard<P>) -> Result<()> {
        drop(guard);
        Ok(())
    }
}

/// Lock hooks called around the blocking steps of `end_checkpoint`.
pub trait CheckpointHooks {
    /// Releases caller-held locks before the checkpoint blocks on a pair.
    fn yield_locks(&self) {}
    /// Reacquires them afterwards.
    fn reacquire_locks(&self) {}
}

/// Hooks that do nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoCheckpointHooks;

impl CheckpointHooks for NoCheckpointHooks {}
