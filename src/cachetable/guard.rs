use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::types::{FileNum, FullHash, PageId, PairKey};

use super::attr::PairAttr;
use super::ops::{FlushRequest, Payload};
use super::pair::{Pair, PairState};
use super::table::Shared;

pub(crate) type ReadGuard<P> = ArcRwLockReadGuard<RawRwLock, Option<P>>;
pub(crate) type WriteGuard<P> = ArcRwLockWriteGuard<RawRwLock, Option<P>>;

/// Requested access to a pinned page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinMode {
    /// Many readers at once.
    Shared,
    /// One holder, allowed to mutate the payload.
    Exclusive,
}

pub(crate) enum ValueGuard<P> {
    Read(ReadGuard<P>),
    Write(WriteGuard<P>),
}

/// A pinned page. Dropping the guard unpins it.
///
/// Changes made through an exclusive guard must be reported with
/// [`PinGuard::mark_dirty`] (or [`PinGuard::unpin`]) so the cache writes them
/// back.
pub struct PinGuard<P: Payload> {
    table: Arc<Shared<P>>,
    pair: Arc<Pair<P>>,
    guard: Option<ValueGuard<P>>,
    key: PairKey,
    fullhash: FullHash,
    dirty: bool,
    new_attr: Option<PairAttr>,
}

/// An exclusively pinned page passed alongside a pin or put so that marking
/// it dirty is atomic with respect to checkpoints.
pub struct DependentPair<'a, P: Payload> {
    /// The already pinned page.
    pub guard: &'a mut PinGuard<P>,
    /// Mark it dirty.
    pub dirty: bool,
}

impl<'a, P: Payload> DependentPair<'a, P> {
    /// Pairs `guard` with its desired dirty state.
    pub fn new(guard: &'a mut PinGuard<P>, dirty: bool) -> Self {
        Self { guard, dirty }
    }
}

impl<P: Payload> PinGuard<P> {
    pub(crate) fn new(table: Arc<Shared<P>>, pair: Arc<Pair<P>>, guard: ValueGuard<P>) -> Self {
        let (key, fullhash) = {
            let meta = pair.meta();
            (meta.key, meta.fullhash)
        };
        Self {
            table,
            pair,
            guard: Some(guard),
            key,
            fullhash,
            dirty: false,
            new_attr: None,
        }
    }

    /// Page number.
    pub fn page_id(&self) -> PageId {
        self.key.page_id
    }

    /// File number.
    pub fn filenum(&self) -> FileNum {
        self.key.filenum
    }

    /// Identity hash the page is indexed under.
    pub fn fullhash(&self) -> FullHash {
        self.fullhash
    }

    /// Access mode of this pin.
    pub fn mode(&self) -> PinMode {
        match self.guard {
            Some(ValueGuard::Write(_)) => PinMode::Exclusive,
            _ => PinMode::Shared,
        }
    }

    /// The pinned payload.
    pub fn payload(&self) -> &P {
        match self.guard.as_ref() {
            Some(ValueGuard::Read(guard)) => (**guard).as_ref(),
            Some(ValueGuard::Write(guard)) => (**guard).as_ref(),
            None => None,
        }
        .expect("pinned pair holds a payload")
    }

    /// Mutable access; exclusive pins only.
    pub fn payload_mut(&mut self) -> Result<&mut P> {
        match self.guard.as_mut() {
            Some(ValueGuard::Write(guard)) => (**guard)
                .as_mut()
                .ok_or(CacheError::Invalid("pinned pair holds no payload")),
            _ => Err(CacheError::Invalid("payload_mut requires an exclusive pin")),
        }
    }

    /// Records that the payload changed; exclusive pins only.
    pub fn mark_dirty(&mut self) -> Result<()> {
        if self.mode() != PinMode::Exclusive {
            return Err(CacheError::Invalid("only exclusive pins can dirty a page"));
        }
        self.dirty = true;
        Ok(())
    }

    /// Attribute to install at unpin.
    pub fn set_attr(&mut self, attr: PairAttr) {
        self.new_attr = Some(attr);
    }

    /// Current attribute, including a pending [`PinGuard::set_attr`].
    pub fn attr(&self) -> PairAttr {
        self.new_attr.unwrap_or_else(|| self.pair.meta().attr)
    }

    /// True if the page has unwritten changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.pair.meta().dirty
    }

    /// Unpins with an explicit dirty flag and optional new attribute.
    pub fn unpin(mut self, dirty: bool, new_attr: Option<PairAttr>) -> Result<()> {
        if let Some(attr) = new_attr {
            self.new_attr = Some(attr);
        }
        let outcome = if dirty { self.mark_dirty() } else { Ok(()) };
        self.release();
        outcome
    }

    /// Unpins and removes the page from the cache without writing it.
    ///
    /// `on_remove` receives the page id and whether a checkpoint still owed a
    /// write of the page.
    pub fn unpin_and_remove<F>(mut self, on_remove: F) -> Result<()>
    where
        F: FnOnce(PageId, bool),
    {
        if self.mode() != PinMode::Exclusive {
            self.release();
            return Err(CacheError::Invalid("unpin_and_remove requires an exclusive pin"));
        }
        let Some(ValueGuard::Write(mut guard)) = self.guard.take() else {
            return Err(CacheError::Invalid("unpin_and_remove requires an exclusive pin"));
        };
        let table = Arc::clone(&self.table);
        let pair = Arc::clone(&self.pair);
        {
            let mut meta = pair.meta();
            pair.wait_for_clone(&mut meta);
        }
        let key = pair.key();
        table.index.write().remove(key, &pair);
        let (attr, for_checkpoint) = {
            let mut meta = pair.meta();
            meta.removed = true;
            meta.state = PairState::OnDisk;
            meta.dirty = false;
            meta.pins = meta.pins.saturating_sub(1);
            meta.writer_pinned = false;
            let pending = std::mem::replace(&mut meta.checkpoint_pending, false);
            (meta.attr, pending)
        };
        table.sizes.sub(&attr);
        let outcome = match guard.take() {
            Some(mut payload) => pair.ops.flush(
                &*pair.file.io,
                key.page_id,
                &mut payload,
                attr,
                FlushRequest::evict(false, for_checkpoint),
            ),
            None => Ok(attr),
        };
        on_remove(key.page_id, for_checkpoint);
        pair.io_done.notify_all();
        drop(guard);
        table.note_unpin();
        debug!(key = %key, for_checkpoint, "cachetable.pair.removed");
        outcome.map(|_| ())
    }

    /// Gives the page a new page id; exclusive pins only. Fails with
    /// `AlreadyExists` when the target id is resident.
    pub fn rename(&mut self, page_id: PageId, fullhash: FullHash) -> Result<()> {
        if self.mode() != PinMode::Exclusive {
            return Err(CacheError::Invalid("rename requires an exclusive pin"));
        }
        let new_key = PairKey::new(self.key.filenum, page_id);
        {
            let mut index = self.table.index.write();
            index.rekey(self.key, new_key, &self.pair)?;
            let mut meta = self.pair.meta();
            meta.key = new_key;
            meta.fullhash = fullhash;
        }
        debug!(from = %self.key, to = %new_key, "cachetable.pair.renamed");
        self.key = new_key;
        self.fullhash = fullhash;
        Ok(())
    }

    pub(crate) fn pair(&self) -> &Arc<Pair<P>> {
        &self.pair
    }

    pub(crate) fn write_guard_mut(&mut self) -> Result<&mut WriteGuard<P>> {
        match self.guard.as_mut() {
            Some(ValueGuard::Write(guard)) => Ok(guard),
            _ => Err(CacheError::Invalid("dependent pairs must be pinned exclusively")),
        }
    }

    pub(crate) fn force_dirty(&mut self) {
        self.dirty = true;
    }

    fn release(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let exclusive = matches!(guard, ValueGuard::Write(_));
        {
            let mut meta = self.pair.meta();
            if self.dirty && exclusive {
                meta.dirty = true;
            }
            if let Some(attr) = self.new_attr.take() {
                self.table.sizes.replace(&meta.attr, &attr);
                meta.attr = attr;
            }
            meta.pins = meta.pins.saturating_sub(1);
            if exclusive {
                meta.writer_pinned = false;
            }
        }
        drop(guard);
        self.table.note_unpin();
    }
}

impl<P: Payload> Deref for PinGuard<P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.payload()
    }
}

impl<P: Payload> Drop for PinGuard<P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<P: Payload> fmt::Debug for PinGuard<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinGuard")
            .field("key", &self.key)
            .field("mode", &self.mode())
            .field("dirty", &self.dirty)
            .finish()
    }
}
