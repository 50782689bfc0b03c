use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::error::{CacheError, Result};
use crate::primitives::concurrency::BackgroundJobs;
use crate::primitives::io::FileIo;
use crate::types::{FileNum, FullHash, PageId};

use super::ops::{PageOps, Payload};
use super::pair::{Pair, PairState};
use super::table::Shared;

/// Per-file callbacks run at checkpoint and close boundaries.
pub trait FileHooks: Send + Sync + 'static {
    /// Checkpoint `id` has marked its pending pairs.
    fn begin_checkpoint(&self, _id: u64) -> Result<()> {
        Ok(())
    }
    /// All pending pairs of checkpoint `id` are written; persist the header.
    fn checkpoint(&self, _id: u64) -> Result<()> {
        Ok(())
    }
    /// Checkpoint `id` finished.
    fn end_checkpoint(&self, _id: u64) -> Result<()> {
        Ok(())
    }
    /// The file is closing; `checkpoint_pending` is true when a checkpoint was
    /// in progress.
    fn close(&self, _checkpoint_pending: bool) -> Result<()> {
        Ok(())
    }
    /// The checkpoint starts treating this file as part of its cut.
    fn note_pin_by_checkpoint(&self) {}
    /// The checkpoint is done with this file.
    fn note_unpin_by_checkpoint(&self) {}
}

/// Hooks that do nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoFileHooks;

impl FileHooks for NoFileHooks {}

pub(crate) struct FileShared<P: Payload> {
    pub filenum: FileNum,
    pub io: Arc<dyn FileIo>,
    pub ops: Arc<dyn PageOps<P>>,
    pub jobs: Arc<BackgroundJobs>,
    pub hooks: RwLock<Arc<dyn FileHooks>>,
    pub closed: AtomicBool,
    pub path: Option<PathBuf>,
}

impl<P: Payload> FileShared<P> {
    pub fn new(
        filenum: FileNum,
        io: Arc<dyn FileIo>,
        ops: Arc<dyn PageOps<P>>,
        path: Option<PathBuf>,
    ) -> Self {
        Self {
            filenum,
            io,
            ops,
            jobs: BackgroundJobs::new(),
            hooks: RwLock::new(Arc::new(NoFileHooks)),
            closed: AtomicBool::new(false),
            path,
        }
    }

    pub fn hooks(&self) -> Arc<dyn FileHooks> {
        Arc::clone(&self.hooks.read())
    }

    pub fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }
}

/// Handle to a file registered with a cache table.
pub struct CacheFile<P: Payload> {
    pub(crate) inner: Arc<FileShared<P>>,
}

impl<P: Payload> Clone for CacheFile<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Payload> CacheFile<P> {
    /// Number identifying the file while it is open.
    pub fn filenum(&self) -> FileNum {
        self.inner.filenum
    }

    /// Full hash of `page_id` in this file.
    pub fn fullhash(&self, page_id: PageId) -> FullHash {
        crate::types::fullhash(self.inner.filenum, page_id)
    }

    /// Storage handle given to page callbacks.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.inner.io
    }

    /// Path the file was opened from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// True once `close_file` ran.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Installs checkpoint and close hooks.
    pub fn set_hooks(&self, hooks: Arc<dyn FileHooks>) {
        *self.inner.hooks.write() = hooks;
    }
}

impl<P: Payload> fmt::Debug for CacheFile<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFile")
            .field("filenum", &self.inner.filenum)
            .field("path", &self.inner.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Open files by number; numbers are reused after close.
pub(crate) struct FileRegistry<P: Payload> {
    files: FxHashMap<FileNum, Arc<FileShared<P>>>,
}

impl<P: Payload> Default for FileRegistry<P> {
    fn default() -> Self {
        Self {
            files: FxHashMap::default(),
        }
    }
}

impl<P: Payload> FileRegistry<P> {
    pub fn next_filenum(&self) -> Result<FileNum> {
        (0..=u32::MAX)
            .map(FileNum)
            .find(|num| !self.files.contains_key(num))
            .ok_or(CacheError::Invalid("file numbers exhausted"))
    }

    pub fn register(&mut self, file: Arc<FileShared<P>>) {
        self.files.insert(file.filenum, file);
    }

    pub fn unregister(&mut self, filenum: FileNum) -> Option<Arc<FileShared<P>>> {
        self.files.remove(&filenum)
    }

    pub fn get(&self, filenum: FileNum) -> Option<Arc<FileShared<P>>> {
        self.files.get(&filenum).cloned()
    }

    pub fn all(&self) -> Vec<Arc<FileShared<P>>> {
        let mut files: Vec<_> = self.files.values().cloned().collect();
        files.sort_by_key(|file| file.filenum);
        files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl<P: Payload> Shared<P> {
    /// Waits for the file's background jobs, then writes and evicts each of
    /// its pages. The file stays open.
    pub(crate) fn flush_file(&self, file: &Arc<FileShared<P>>) -> Result<()> {
        file.check_open()?;
        if self.index.read().count_pinned(Some(file.filenum)) > 0 {
            return Err(CacheError::Invalid("flush of a file with pinned pages"));
        }
        file.jobs.wait_idle();
        let pairs = self.index.read().pairs_of(file.filenum);
        let mut outcome = Ok(());
        for pair in pairs {
            if let Err(err) = self.flush_and_evict_pair(&pair) {
                warn!(key = %pair.key(), error = %err, "cachetable.file.flush_failed");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        outcome
    }

    /// Stops new background work for the file, waits for the running jobs,
    /// writes back and frees its pages and releases its number.
    ///
    /// Pages whose write fails are dropped; the first failure is returned
    /// after the file is fully closed.
    pub(crate) fn close_file(&self, file: &Arc<FileShared<P>>) -> Result<()> {
        if self.index.read().count_pinned(Some(file.filenum)) > 0 {
            return Err(CacheError::Invalid("close of a file with pinned pages"));
        }
        if file.closed.swap(true, Ordering::AcqRel) {
            return Err(CacheError::Closed);
        }
        file.jobs.close_and_wait();
        let pairs = self.index.read().pairs_of(file.filenum);
        let mut outcome = Ok(());
        for pair in pairs {
            if let Err(err) = self.flush_and_evict_pair(&pair) {
                warn!(key = %pair.key(), error = %err, "cachetable.file.close_write_failed");
                self.forget_pair(&pair);
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        let hook_result = file.hooks().close(self.checkpoint_in_progress());
        self.files.lock().unregister(file.filenum);
        self.signal_flow();
        info!(filenum = %file.filenum, "cachetable.file.close");
        outcome.and(hook_result)
    }

    fn flush_and_evict_pair(&self, pair: &Arc<Pair<P>>) -> Result<()> {
        let guard = pair.value.write_arc();
        {
            let mut meta = pair.meta();
            if meta.removed {
                return Ok(());
            }
            pair.wait_for_clone(&mut meta);
        }
        self.evict_pair(pair, guard).map(|_| ())
    }

    /// Drops a pair without writing it.
    fn forget_pair(&self, pair: &Arc<Pair<P>>) {
        let mut guard = pair.value.write_arc();
        let key = pair.key();
        self.index.write().remove(key, pair);
        let attr = {
            let mut meta = pair.meta();
            if meta.removed {
                return;
            }
            meta.removed = true;
            meta.state = PairState::OnDisk;
            meta.dirty = false;
            meta.checkpoint_pending = false;
            meta.attr
        };
        self.sizes.sub(&attr);
        *guard = None;
        pair.io_done.notify_all();
    }
}
