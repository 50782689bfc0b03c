use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{CacheError, PanicState, Result};
use crate::primitives::concurrency::{BackgroundJobs, WorkerPool};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{FileNum, FullHash, PageId, PairKey};

use super::attr::{PairAttr, SizeCounters};
use super::checkpoint::{CheckpointAction, CheckpointState};
use super::file::{CacheFile, FileRegistry, FileShared};
use super::guard::{DependentPair, PinGuard, PinMode, ValueGuard, WriteGuard};
use super::index::PageIndex;
use super::ops::{CheckpointHooks, PageOps, Payload};
use super::options::{CacheTableOptions, Watermarks};
use super::pair::{Pair, PairState, PairStateInfo};
use super::periodic::{spawn_periodic, Periodic};
use super::status::{CacheTableStatus, StatCounters};

/// Longest single sleep of a waiting admission before it retries eviction.
const ADMISSION_RECHECK: Duration = Duration::from_millis(50);

/// State shared by every handle, guard and background thread of one table.
pub(crate) struct Shared<P: Payload> {
    pub options: Mutex<CacheTableOptions>,
    pub index: RwLock<PageIndex<P>>,
    pub files: Mutex<FileRegistry<P>>,
    /// Held in write mode while `begin_checkpoint` marks pending pairs.
    pub checkpoint_gate: RwLock<()>,
    pub checkpoint: Mutex<CheckpointState<P>>,
    pub sizes: SizeCounters,
    pub size_limit: AtomicI64,
    pub reserved: AtomicI64,
    pub pinned: AtomicUsize,
    pub stats: StatCounters,
    pub panic: PanicState,
    /// Runs the table's own jobs. None of them waits on a pair lock.
    pub pool: WorkerPool,
    /// Runs owner jobs, which may pin pages and wait on `pool`.
    client_pool: WorkerPool,
    pub clone_jobs: Arc<BackgroundJobs>,
    flow: Mutex<()>,
    flow_cv: Condvar,
    flow_epoch: AtomicU64,
    flow_waiters: AtomicUsize,
    pub evictor: Arc<Periodic>,
    pub cleaner: Arc<Periodic>,
    pub checkpointer: Arc<Periodic>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A concurrent page cache shared by every file opened through it.
///
/// Cloning the handle is cheap; all clones refer to the same table.
pub struct CacheTable<P: Payload> {
    shared: Arc<Shared<P>>,
}

impl<P: Payload> Clone for CacheTable<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Payload> CacheTable<P> {
    /// Creates a table and starts its worker pools and background threads.
    pub fn new(options: CacheTableOptions) -> Result<Self> {
        let options = options.normalize();
        let pool = WorkerPool::new("cachetable-worker", options.worker_threads)?;
        let client_pool = WorkerPool::new("cachetable-client", options.client_threads)?;
        let shared = Arc::new(Shared {
            size_limit: AtomicI64::new(options.size_limit as i64),
            evictor: Periodic::new(Some(options.evictor_period())),
            cleaner: Periodic::new(options.cleaner_period()),
            checkpointer: Periodic::new(options.checkpoint_period()),
            options: Mutex::new(options.clone()),
            index: RwLock::new(PageIndex::default()),
            files: Mutex::new(FileRegistry::default()),
            checkpoint_gate: RwLock::new(()),
            checkpoint: Mutex::new(CheckpointState::default()),
            sizes: SizeCounters::default(),
            reserved: AtomicI64::new(0),
            pinned: AtomicUsize::new(0),
            stats: StatCounters::default(),
            panic: PanicState::default(),
            pool,
            client_pool,
            clone_jobs: BackgroundJobs::new(),
            flow: Mutex::new(()),
            flow_cv: Condvar::new(),
            flow_epoch: AtomicU64::new(0),
            flow_waiters: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&shared);
        let threads = vec![
            spawn_periodic(
                "cachetable-evictor",
                weak.clone(),
                Arc::clone(&shared.evictor),
                Shared::evictor_pass,
            )?,
            spawn_periodic(
                "cachetable-cleaner",
                weak.clone(),
                Arc::clone(&shared.cleaner),
                Shared::cleaner_pass,
            )?,
            spawn_periodic(
                "cachetable-checkpointer",
                weak,
                Arc::clone(&shared.checkpointer),
                Shared::checkpointer_pass,
            )?,
        ];
        *shared.threads.lock() = threads;
        info!(
            size_limit = options.size_limit,
            workers = options.worker_threads,
            clients = options.client_threads,
            "cachetable.open"
        );
        Ok(Self { shared })
    }

    /// Options the table was created with, including runtime changes.
    pub fn options(&self) -> CacheTableOptions {
        self.shared.options.lock().clone()
    }

    /// Registers a file whose pages are loaded and written by `ops`.
    pub fn open_file(&self, io: Arc<dyn FileIo>, ops: Arc<dyn PageOps<P>>) -> Result<CacheFile<P>> {
        self.shared.open_file(io, ops, None)
    }

    /// Opens (creating if needed) `path` and registers it.
    pub fn open_path(&self, path: impl AsRef<Path>, ops: Arc<dyn PageOps<P>>) -> Result<CacheFile<P>> {
        let path = path.as_ref();
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
        self.shared.open_file(io, ops, Some(path.to_path_buf()))
    }

    /// Looks up an open file by number.
    pub fn file_of_filenum(&self, filenum: FileNum) -> Result<CacheFile<P>> {
        self.shared
            .files
            .lock()
            .get(filenum)
            .map(|inner| CacheFile { inner })
            .ok_or(CacheError::NotFound)
    }

    /// Waits for the file's background jobs, then writes and evicts every
    /// page of it. All of its pages must be unpinned.
    pub fn flush_file(&self, file: &CacheFile<P>) -> Result<()> {
        self.shared.flush_file(&file.inner)
    }

    /// Waits for the file's background jobs, writes and frees its pages and
    /// releases its number.
    pub fn close_file(&self, file: &CacheFile<P>) -> Result<()> {
        self.shared.close_file(&file.inner)
    }

    /// Pins a page, fetching it on a miss. Blocks on contention.
    pub fn get_and_pin(
        &self,
        file: &CacheFile<P>,
        page_id: PageId,
        fullhash: FullHash,
        mode: PinMode,
    ) -> Result<PinGuard<P>> {
        self.shared.get_and_pin(&file.inner, page_id, fullhash, mode)
    }

    /// Pins a page without blocking. Returns `TryAgain` after starting any
    /// background work that would let a later attempt succeed.
    pub fn get_and_pin_nonblocking(
        &self,
        file: &CacheFile<P>,
        page_id: PageId,
        fullhash: FullHash,
        mode: PinMode,
    ) -> Result<PinGuard<P>> {
        self.shared
            .get_and_pin_nonblocking(&file.inner, page_id, fullhash, mode)
    }

    /// Pins a page and, atomically with respect to checkpoints, marks the
    /// already pinned `dependents` dirty as requested.
    pub fn get_and_pin_with_dependents(
        &self,
        file: &CacheFile<P>,
        page_id: PageId,
        fullhash: FullHash,
        mode: PinMode,
        dependents: &mut [DependentPair<'_, P>],
    ) -> Result<PinGuard<P>> {
        let guard = self.shared.get_and_pin(&file.inner, page_id, fullhash, mode)?;
        self.shared.settle_dependents(dependents)?;
        Ok(guard)
    }

    /// Pins a resident, dirty page that needs no I/O; `NotFound` otherwise.
    pub fn maybe_get_and_pin(
        &self,
        file: &CacheFile<P>,
        page_id: PageId,
        fullhash: FullHash,
        mode: PinMode,
    ) -> Result<PinGuard<P>> {
        self.shared
            .maybe_get_and_pin(&file.inner, page_id, fullhash, mode, true)
    }

    /// Like [`CacheTable::maybe_get_and_pin`] but also accepts clean pages.
    pub fn maybe_get_and_pin_clean(
        &self,
        file: &CacheFile<P>,
        page_id: PageId,
        fullhash: FullHash,
        mode: PinMode,
    ) -> Result<PinGuard<P>> {
        self.shared
            .maybe_get_and_pin(&file.inner, page_id, fullhash, mode, false)
    }

    /// Inserts a new dirty page, pinned exclusively. Waits for room first.
    pub fn put(
        &self,
        file: &CacheFile<P>,
        page_id: PageId,
        fullhash: FullHash,
        payload: P,
        attr: PairAttr,
    ) -> Result<PinGuard<P>> {
        self.shared
            .put(&file.inner, page_id, fullhash, payload, attr, &mut [])
    }

    /// [`CacheTable::put`] plus dependent marking as in
    /// [`CacheTable::get_and_pin_with_dependents`].
    pub fn put_with_dependents(
        &self,
        file: &CacheFile<P>,
        page_id: PageId,
        fullhash: FullHash,
        payload: P,
        attr: PairAttr,
        dependents: &mut [DependentPair<'_, P>],
    ) -> Result<PinGuard<P>> {
        self.shared
            .put(&file.inner, page_id, fullhash, payload, attr, dependents)
    }

    /// Starts a background fetch (or partial fetch) if the page needs one.
    /// Returns whether work was started.
    pub fn prefetch(&self, file: &CacheFile<P>, page_id: PageId, fullhash: FullHash) -> Result<bool> {
        self.shared.prefetch(&file.inner, page_id, fullhash)
    }

    /// Marks every dirty page as owed to a new checkpoint. Returns its id.
    pub fn begin_checkpoint(&self) -> Result<u64> {
        self.shared.begin_checkpoint()
    }

    /// Writes every page still owed to the running checkpoint, calling
    /// `hooks` around blocking steps.
    pub fn end_checkpoint(&self, hooks: &dyn CheckpointHooks) -> Result<()> {
        self.shared.end_checkpoint(hooks)
    }

    /// Runs a full checkpoint.
    pub fn checkpoint(&self) -> Result<u64> {
        self.shared.checkpoint()
    }

    /// Runs one cleaner pass now. Returns the number of cleaner callbacks run.
    pub fn run_cleaner_once(&self) -> usize {
        self.shared.run_cleaner_once()
    }

    /// Evicts in the calling thread until resident bytes fit the limit or
    /// nothing else can go. Returns bytes freed.
    pub fn evict_to_limit(&self) -> i64 {
        let limit = self.shared.effective_limit();
        self.shared.evict_until(limit)
    }

    /// Runs `job` on the client pool; closing `file` waits for it. The job
    /// may pin pages.
    pub fn enqueue_job<F>(&self, file: &CacheFile<P>, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        file.inner.check_open()?;
        let ticket = file.inner.jobs.add()?;
        self.shared.client_pool.submit(Box::new(move || {
            let _ticket = ticket;
            job();
        }))
    }

    /// Reserves `fraction` of the unreserved limit for a bulk loader and
    /// evicts to make room. Returns the bytes reserved.
    pub fn reserve_memory(&self, fraction: f64) -> u64 {
        self.shared.reserve_memory(fraction)
    }

    /// Returns `bytes` previously reserved.
    pub fn release_reserved_memory(&self, bytes: u64) {
        self.shared.release_reserved_memory(bytes);
    }

    /// Changes the limit; wakes the evictor if it shrank.
    pub fn set_size_limit(&self, bytes: u64) {
        self.shared.options.lock().size_limit = bytes;
        self.shared.size_limit.store(bytes as i64, Ordering::Release);
        self.shared.evictor.kick();
        self.shared.signal_flow();
    }

    /// Changes the cleaner period; 0 disables it.
    pub fn set_cleaner_period(&self, period_ms: u64) {
        let mut options = self.shared.options.lock();
        options.cleaner_period_ms = period_ms;
        self.shared.cleaner.set_period(options.cleaner_period());
    }

    /// Changes the number of pages the cleaner works on per wakeup.
    pub fn set_cleaner_iterations(&self, iterations: u32) {
        self.shared.options.lock().cleaner_iterations = iterations.max(1);
    }

    /// Changes the checkpoint period; `None` disables periodic checkpoints.
    pub fn set_checkpoint_period(&self, period_ms: Option<u64>) {
        let mut options = self.shared.options.lock();
        options.checkpoint_period_ms = period_ms.filter(|ms| *ms > 0);
        self.shared.checkpointer.set_period(options.checkpoint_period());
    }

    /// Eviction thresholds for the current effective limit.
    pub fn watermarks(&self) -> Watermarks {
        Watermarks::for_limit(self.shared.effective_limit())
    }

    /// Counters and sizes.
    pub fn status(&self) -> CacheTableStatus {
        self.shared.status()
    }

    /// State of one resident page.
    pub fn pair_state(&self, file: &CacheFile<P>, page_id: PageId) -> Option<PairStateInfo> {
        let key = PairKey::new(file.filenum(), page_id);
        let pair = self.shared.index.read().get(key)?;
        let meta = pair.meta();
        Some(PairStateInfo::from(&*meta))
    }

    /// Checks index links and accounting. Intended for quiescent tables.
    pub fn verify(&self) -> Result<()> {
        self.shared.verify()
    }

    /// Pinned pages belonging to `file`.
    pub fn count_pinned(&self, file: &CacheFile<P>) -> usize {
        self.shared.index.read().count_pinned(Some(file.filenum()))
    }

    /// Resident pages across all files.
    pub fn pair_count(&self) -> usize {
        self.shared.index.read().len()
    }

    /// Fails if any page is pinned.
    pub fn assert_all_unpinned(&self) -> Result<()> {
        match self.shared.index.read().count_pinned(None) {
            0 => Ok(()),
            n => Err(CacheError::InvalidOwned(format!("{n} pairs still pinned"))),
        }
    }

    /// Fatal failure recorded by a checkpoint, if any.
    pub fn panic_reason(&self) -> Option<String> {
        self.shared.panic.reason()
    }

    /// Stops background threads. Every file must be closed.
    pub fn close(self) -> Result<()> {
        if !self.shared.files.lock().is_empty() {
            return Err(CacheError::Invalid("close with open cachefiles"));
        }
        self.shared.closed.store(true, Ordering::Release);
        self.shared.stop_background();
        info!("cachetable.close");
        Ok(())
    }
}

impl<P: Payload> Shared<P> {
    pub(crate) fn check_usable(&self) -> Result<()> {
        self.panic.check()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    pub(crate) fn effective_limit(&self) -> i64 {
        let limit = self.size_limit.load(Ordering::Acquire);
        (limit - self.reserved.load(Ordering::Acquire)).max(0)
    }

    fn open_file(
        &self,
        io: Arc<dyn FileIo>,
        ops: Arc<dyn PageOps<P>>,
        path: Option<std::path::PathBuf>,
    ) -> Result<CacheFile<P>> {
        self.check_usable()?;
        let mut files = self.files.lock();
        let filenum = files.next_filenum()?;
        let inner = Arc::new(FileShared::new(filenum, io, ops, path));
        files.register(Arc::clone(&inner));
        info!(filenum = %filenum, path = ?inner.path, "cachetable.file.open");
        Ok(CacheFile { inner })
    }

    fn record_pin(&self, pair: &Pair<P>, exclusive: bool) {
        let mut meta = pair.meta();
        meta.pins += 1;
        if exclusive {
            meta.writer_pinned = true;
        }
        meta.touch();
        drop(meta);
        self.pinned.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_unpin(&self) {
        self.pinned.fetch_sub(1, Ordering::AcqRel);
        self.signal_flow();
    }

    /// Wakes admissions waiting for memory to be released.
    pub(crate) fn signal_flow(&self) {
        self.flow_epoch.fetch_add(1, Ordering::SeqCst);
        if self.flow_waiters.load(Ordering::SeqCst) > 0 {
            let _flow = self.flow.lock();
            self.flow_cv.notify_all();
        }
    }

    pub(crate) fn pin(self: &Arc<Self>, pair: Arc<Pair<P>>, guard: ValueGuard<P>) -> PinGuard<P> {
        self.record_pin(&pair, matches!(guard, ValueGuard::Write(_)));
        PinGuard::new(Arc::clone(self), pair, guard)
    }

    fn get_and_pin(
        self: &Arc<Self>,
        file: &Arc<FileShared<P>>,
        page_id: PageId,
        fullhash: FullHash,
        mode: PinMode,
    ) -> Result<PinGuard<P>> {
        self.check_usable()?;
        file.check_open()?;
        let key = PairKey::new(file.filenum, page_id);
        loop {
            let found = self.index.read().find(key, fullhash);
            if let Some(pair) = found {
                if let Some(guard) = self.pin_resident(pair, mode)? {
                    StatCounters::bump(&self.stats.hits);
                    return Ok(guard);
                }
                continue;
            }
            let Some((pair, mut guard)) = self.insert_for_fetch(file, key, fullhash)? else {
                continue;
            };
            self.complete_fetch(&pair, &mut guard)?;
            self.assist_eviction();
            return match mode {
                PinMode::Shared => Ok(self.pin(pair, ValueGuard::Read(WriteGuard::downgrade(guard)))),
                PinMode::Exclusive => {
                    let _gate = self.checkpoint_gate.read();
                    self.settle_checkpoint_before_mutation(&pair, &mut guard)?;
                    Ok(self.pin(pair, ValueGuard::Write(guard)))
                }
            };
        }
    }

    /// Locks a resident pair for a blocking pin. `None` means the pair left
    /// the cache while we waited and the lookup must be retried.
    fn pin_resident(self: &Arc<Self>, pair: Arc<Pair<P>>, mode: PinMode) -> Result<Option<PinGuard<P>>> {
        match mode {
            PinMode::Shared => {
                let guard = pair.value.read_arc();
                if pair.meta().removed {
                    return Ok(None);
                }
                if !self.needs_partial_fetch(&pair, &guard) {
                    return Ok(Some(self.pin(pair, ValueGuard::Read(guard))));
                }
                drop(guard);
                let mut guard = pair.value.write_arc();
                if pair.meta().removed {
                    return Ok(None);
                }
                self.partial_fetch_locked(&pair, &mut guard)?;
                let guard = WriteGuard::downgrade(guard);
                Ok(Some(self.pin(pair, ValueGuard::Read(guard))))
            }
            PinMode::Exclusive => {
                let mut guard = pair.value.write_arc();
                if pair.meta().removed {
                    return Ok(None);
                }
                if self.needs_partial_fetch(&pair, &guard) {
                    self.partial_fetch_locked(&pair, &mut guard)?;
                }
                let _gate = self.checkpoint_gate.read();
                self.settle_checkpoint_before_mutation(&pair, &mut guard)?;
                Ok(Some(self.pin(pair, ValueGuard::Write(guard))))
            }
        }
    }

    fn get_and_pin_nonblocking(
        self: &Arc<Self>,
        file: &Arc<FileShared<P>>,
        page_id: PageId,
        fullhash: FullHash,
        mode: PinMode,
    ) -> Result<PinGuard<P>> {
        self.check_usable()?;
        file.check_open()?;
        let key = PairKey::new(file.filenum, page_id);
        let found = self.index.read().find(key, fullhash);
        let Some(pair) = found else {
            self.start_background_fetch(file, key, fullhash)?;
            return Err(CacheError::TryAgain);
        };
        match mode {
            PinMode::Shared => {
                let Some(guard) = pair.value.try_read_arc() else {
                    return Err(CacheError::TryAgain);
                };
                if pair.meta().removed {
                    return Err(CacheError::TryAgain);
                }
                if self.needs_partial_fetch(&pair, &guard) {
                    drop(guard);
                    self.start_background_partial_fetch(&pair)?;
                    return Err(CacheError::TryAgain);
                }
                StatCounters::bump(&self.stats.hits);
                Ok(self.pin(pair, ValueGuard::Read(guard)))
            }
            PinMode::Exclusive => {
                let Some(mut guard) = pair.value.try_write_arc() else {
                    return Err(CacheError::TryAgain);
                };
                if pair.meta().removed {
                    return Err(CacheError::TryAgain);
                }
                if self.needs_partial_fetch(&pair, &guard) {
                    drop(guard);
                    self.start_background_partial_fetch(&pair)?;
                    return Err(CacheError::TryAgain);
                }
                let Some(gate) = self.checkpoint_gate.try_read() else {
                    return Err(CacheError::TryAgain);
                };
                match self.prepare_checkpoint_write(&pair, &mut guard, false)? {
                    CheckpointAction::Done => {}
                    CheckpointAction::Clone(write) => self.submit_clone_write(write),
                    CheckpointAction::InPlace => {
                        drop(gate);
                        drop(guard);
                        self.start_background_checkpoint_write(&pair)?;
                        return Err(CacheError::TryAgain);
                    }
                    CheckpointAction::Busy => return Err(CacheError::TryAgain),
                }
                StatCounters::bump(&self.stats.hits);
                Ok(self.pin(pair, ValueGuard::Write(guard)))
            }
        }
    }

    fn maybe_get_and_pin(
        self: &Arc<Self>,
        file: &Arc<FileShared<P>>,
        page_id: PageId,
        fullhash: FullHash,
        mode: PinMode,
        require_dirty: bool,
    ) -> Result<PinGuard<P>> {
        self.check_usable()?;
        file.check_open()?;
        let key = PairKey::new(file.filenum, page_id);
        let pair = self
            .index
            .read()
            .find(key, fullhash)
            .ok_or(CacheError::NotFound)?;
        let guard = match mode {
            PinMode::Shared => ValueGuard::Read(pair.value.try_read_arc().ok_or(CacheError::NotFound)?),
            PinMode::Exclusive => {
                ValueGuard::Write(pair.value.try_write_arc().ok_or(CacheError::NotFound)?)
            }
        };
        let _gate = self.checkpoint_gate.try_read().ok_or(CacheError::NotFound)?;
        {
            let meta = pair.meta();
            if meta.removed
                || (require_dirty && !meta.dirty)
                || (mode == PinMode::Exclusive && meta.checkpoint_pending)
            {
                return Err(CacheError::NotFound);
            }
        }
        let needs_fetch = match &guard {
            ValueGuard::Read(g) => self.needs_partial_fetch(&pair, g),
            ValueGuard::Write(g) => self.needs_partial_fetch(&pair, g),
        };
        if needs_fetch {
            return Err(CacheError::NotFound);
        }
        StatCounters::bump(&self.stats.hits);
        Ok(self.pin(pair, guard))
    }

    fn put(
        self: &Arc<Self>,
        file: &Arc<FileShared<P>>,
        page_id: PageId,
        fullhash: FullHash,
        payload: P,
        attr: PairAttr,
        dependents: &mut [DependentPair<'_, P>],
    ) -> Result<PinGuard<P>> {
        self.check_usable()?;
        file.check_open()?;
        let key = PairKey::new(file.filenum, page_id);
        if self.index.read().get(key).is_some() {
            return Err(CacheError::AlreadyExists);
        }
        self.admit(attr.size)?;
        let pair = Pair::new(
            Arc::clone(file),
            key,
            fullhash,
            PairState::Available,
            Some(payload),
            attr,
        );
        pair.meta().dirty = true;
        let guard = pair.value.write_arc();
        {
            let _gate = self.checkpoint_gate.read();
            self.index.write().insert(key, Arc::clone(&pair))?;
            self.sizes.add(&attr);
            for dependent in dependents.iter_mut() {
                self.settle_dependent(dependent)?;
            }
        }
        StatCounters::bump(&self.stats.puts);
        debug!(key = %key, size = attr.size, "cachetable.put");
        self.after_growth();
        Ok(self.pin(pair, ValueGuard::Write(guard)))
    }

    pub(crate) fn settle_dependents(self: &Arc<Self>, dependents: &mut [DependentPair<'_, P>]) -> Result<()> {
        let _gate = self.checkpoint_gate.read();
        for dependent in dependents.iter_mut() {
            self.settle_dependent(dependent)?;
        }
        Ok(())
    }

    fn settle_dependent(self: &Arc<Self>, dependent: &mut DependentPair<'_, P>) -> Result<()> {
        let pair = Arc::clone(dependent.guard.pair());
        let guard = dependent.guard.write_guard_mut()?;
        self.settle_checkpoint_before_mutation(&pair, guard)?;
        if dependent.dirty {
            dependent.guard.force_dirty();
        }
        Ok(())
    }

    fn prefetch(self: &Arc<Self>, file: &Arc<FileShared<P>>, page_id: PageId, fullhash: FullHash) -> Result<bool> {
        self.check_usable()?;
        file.check_open()?;
        let key = PairKey::new(file.filenum, page_id);
        let found = self.index.read().find(key, fullhash);
        match found {
            None => self.start_background_fetch(file, key, fullhash),
            Some(pair) => {
                let Some(guard) = pair.value.try_read_arc() else {
                    return Ok(false);
                };
                if pair.meta().removed || !self.needs_partial_fetch(&pair, &guard) {
                    return Ok(false);
                }
                drop(guard);
                self.start_background_partial_fetch(&pair)?;
                Ok(true)
            }
        }
    }

    /// Creates a `Reading` pair, locked, and publishes it. `None` when another
    /// thread published the key first.
    fn insert_for_fetch(
        &self,
        file: &Arc<FileShared<P>>,
        key: PairKey,
        fullhash: FullHash,
    ) -> Result<Option<(Arc<Pair<P>>, WriteGuard<P>)>> {
        let pair = Pair::new(
            Arc::clone(file),
            key,
            fullhash,
            PairState::Reading,
            None,
            PairAttr::default(),
        );
        let guard = pair.value.write_arc();
        let mut index = self.index.write();
        if let Some(existing) = index.get(key) {
            if existing.meta().fullhash != fullhash {
                return Err(CacheError::InvalidOwned(format!(
                    "fullhash mismatch for page {key}"
                )));
            }
            return Ok(None);
        }
        index.insert(key, Arc::clone(&pair))?;
        drop(index);
        Ok(Some((pair, guard)))
    }

    /// Runs the owner's fetch into a pair published by `insert_for_fetch`.
    /// On failure the pair is withdrawn so a later pin retries the read.
    pub(crate) fn complete_fetch(&self, pair: &Arc<Pair<P>>, guard: &mut WriteGuard<P>) -> Result<()> {
        let started = Instant::now();
        let (key, fullhash) = {
            let meta = pair.meta();
            (meta.key, meta.fullhash)
        };
        match pair.ops.fetch(&*pair.file.io, key.page_id, fullhash) {
            Ok(fetched) => {
                **guard = Some(fetched.payload);
                {
                    let mut meta = pair.meta();
                    meta.attr = fetched.attr;
                    meta.dirty = fetched.dirty;
                    meta.state = PairState::Available;
                }
                self.sizes.add(&fetched.attr);
                StatCounters::bump(&self.stats.misses);
                StatCounters::add(&self.stats.miss_time_us, started.elapsed().as_micros() as u64);
                debug!(key = %key, size = fetched.attr.size, "cachetable.fetch");
                self.after_growth();
                Ok(())
            }
            Err(err) => {
                warn!(key = %key, error = %err, "cachetable.fetch.failed");
                self.withdraw(pair);
                Err(err)
            }
        }
    }

    /// Removes a pair that never became resident.
    fn withdraw(&self, pair: &Arc<Pair<P>>) {
        let key = pair.key();
        self.index.write().remove(key, pair);
        let mut meta = pair.meta();
        meta.removed = true;
        meta.state = PairState::OnDisk;
        drop(meta);
        pair.io_done.notify_all();
    }

    fn start_background_fetch(
        self: &Arc<Self>,
        file: &Arc<FileShared<P>>,
        key: PairKey,
        fullhash: FullHash,
    ) -> Result<bool> {
        let Some((pair, mut guard)) = self.insert_for_fetch(file, key, fullhash)? else {
            return Ok(false);
        };
        let ticket = match file.jobs.add() {
            Ok(ticket) => ticket,
            Err(err) => {
                self.withdraw(&pair);
                return Err(err);
            }
        };
        StatCounters::bump(&self.stats.prefetches);
        let shared = Arc::clone(self);
        self.pool.submit_or_run(Box::new(move || {
            let _ticket = ticket;
            if shared.complete_fetch(&pair, &mut guard).is_ok() {
                pair.meta().touch();
            }
        }));
        Ok(true)
    }

    fn start_background_partial_fetch(self: &Arc<Self>, pair: &Arc<Pair<P>>) -> Result<()> {
        let ticket = pair.file.jobs.add()?;
        let shared = Arc::clone(self);
        let pair = Arc::clone(pair);
        self.pool.submit_or_run(Box::new(move || {
            let _ticket = ticket;
            // A holder of the lock does the partial fetch itself if it needs it.
            let Some(mut guard) = pair.value.try_write_arc() else {
                debug!(key = %pair.key(), "cachetable.partial_fetch.skipped");
                return;
            };
            if pair.meta().removed {
                return;
            }
            if let Err(err) = shared.partial_fetch_locked(&pair, &mut guard) {
                warn!(key = %pair.key(), error = %err, "cachetable.partial_fetch.failed");
            }
        }));
        Ok(())
    }

    fn start_background_checkpoint_write(self: &Arc<Self>, pair: &Arc<Pair<P>>) -> Result<()> {
        let ticket = pair.file.jobs.add()?;
        let shared = Arc::clone(self);
        let pair = Arc::clone(pair);
        self.pool.submit_or_run(Box::new(move || {
            let _ticket = ticket;
            // An exclusive pinner settles the obligation itself; end_checkpoint
            // writes whatever is left.
            let Some(mut guard) = pair.value.try_write_arc() else {
                debug!(key = %pair.key(), "cachetable.checkpoint.background_write_skipped");
                return;
            };
            if pair.meta().removed {
                return;
            }
            let outcome = match shared.prepare_checkpoint_write(&pair, &mut guard, false) {
                Ok(CheckpointAction::Clone(write)) => {
                    shared.submit_clone_write(write);
                    Ok(())
                }
                Ok(CheckpointAction::InPlace) => shared.write_in_place_for_checkpoint(&pair, &mut guard),
                Ok(CheckpointAction::Done) | Ok(CheckpointAction::Busy) => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                warn!(key = %pair.key(), error = %err, "cachetable.checkpoint.background_write_failed");
            }
        }));
        Ok(())
    }

    pub(crate) fn needs_partial_fetch(&self, pair: &Pair<P>, slot: &Option<P>) -> bool {
        slot.as_ref()
            .map_or(false, |payload| pair.ops.partial_fetch_required(payload))
    }

    /// Brings a partially evicted payload back to full residency.
    pub(crate) fn partial_fetch_locked(&self, pair: &Arc<Pair<P>>, guard: &mut WriteGuard<P>) -> Result<()> {
        let Some(payload) = (**guard).as_mut() else {
            return Err(CacheError::Invalid("partial fetch on a pair without payload"));
        };
        if !pair.ops.partial_fetch_required(payload) {
            return Ok(());
        }
        let (key, old_attr, prior) = {
            let mut meta = pair.meta();
            let prior = std::mem::replace(&mut meta.state, PairState::Reading);
            (meta.key, meta.attr, prior)
        };
        let result = pair.ops.partial_fetch(&*pair.file.io, key.page_id, payload);
        let mut meta = pair.meta();
        match result {
            Ok(new_attr) => {
                self.sizes.replace(&old_attr, &new_attr);
                meta.attr = new_attr;
                meta.state = PairState::Available;
                drop(meta);
                StatCounters::bump(&self.stats.partial_fetches);
                debug!(key = %key, size = new_attr.size, "cachetable.partial_fetch");
                self.after_growth();
                Ok(())
            }
            Err(err) => {
                meta.state = prior;
                Err(err)
            }
        }
    }

    /// Called after resident bytes grew outside admission control.
    fn after_growth(&self) {
        let marks = Watermarks::for_limit(self.effective_limit());
        if self.sizes.current() > marks.low_hysteresis {
            self.evictor.kick();
        }
    }

    /// A fetching client far above the limit evicts before continuing.
    fn assist_eviction(self: &Arc<Self>) {
        let marks = Watermarks::for_limit(self.effective_limit());
        if self.sizes.current() > marks.high {
            self.evict_until(marks.high_hysteresis);
        }
    }

    /// Makes room for `incoming` new bytes.
    ///
    /// Evicts on the calling thread first. When eviction stalls with pages
    /// still pinned or bytes in flight, waits for an unpin or eviction to make
    /// room (bounded only by an explicit `admission_wait_ms`). With nothing
    /// pinned or in flight the page is admitted over the limit.
    fn admit(self: &Arc<Self>, incoming: i64) -> Result<()> {
        let started = Instant::now();
        let wait_limit = self.options.lock().admission_wait();
        let mut waited = false;
        loop {
            let limit = self.effective_limit();
            if self.sizes.current() + incoming <= limit {
                break;
            }
            let epoch = self.flow_epoch.load(Ordering::SeqCst);
            let freed = self.evict_until(limit - incoming);
            if self.sizes.current() + incoming <= limit {
                break;
            }
            if freed > 0 {
                continue;
            }
            let in_flight = self.sizes.evicting() > 0 || self.clone_jobs.running() > 0;
            if self.pinned.load(Ordering::Acquire) == 0 && !in_flight {
                debug!(incoming, limit, "cachetable.admission.oversized");
                break;
            }
            let elapsed = started.elapsed();
            let mut slice = ADMISSION_RECHECK;
            if let Some(wait_limit) = wait_limit {
                if elapsed >= wait_limit {
                    warn!(
                        incoming,
                        limit,
                        waited_ms = elapsed.as_millis() as u64,
                        "cachetable.admission.stall"
                    );
                    break;
                }
                slice = slice.min(wait_limit - elapsed);
            }
            if !waited {
                waited = true;
                StatCounters::bump(&self.stats.admission_waits);
                debug!(incoming, limit, "cachetable.admission.wait");
            }
            self.wait_for_flow(epoch, slice);
            self.check_usable()?;
        }
        if waited {
            StatCounters::add(
                &self.stats.admission_wait_us,
                started.elapsed().as_micros() as u64,
            );
        }
        Ok(())
    }

    fn wait_for_flow(&self, epoch: u64, timeout: Duration) {
        let mut flow = self.flow.lock();
        self.flow_waiters.fetch_add(1, Ordering::SeqCst);
        if self.flow_epoch.load(Ordering::SeqCst) == epoch {
            self.flow_cv.wait_for(&mut flow, timeout);
        }
        self.flow_waiters.fetch_sub(1, Ordering::SeqCst);
    }

    fn reserve_memory(self: &Arc<Self>, fraction: f64) -> u64 {
        let fraction = fraction.clamp(0.0, 1.0);
        let unreserved = self.effective_limit();
        let bytes = (unreserved as f64 * fraction) as i64;
        self.reserved.fetch_add(bytes, Ordering::AcqRel);
        info!(bytes, "cachetable.reserve_memory");
        let limit = self.effective_limit();
        if self.sizes.current() > limit {
            self.evict_until(limit);
        }
        bytes as u64
    }

    fn release_reserved_memory(&self, bytes: u64) {
        let bytes = bytes as i64;
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                Some((held - bytes).max(0))
            });
        self.signal_flow();
    }

    fn status(&self) -> CacheTableStatus {
        let mut status = CacheTableStatus::default();
        self.stats.fill(&mut status);
        status.size_current = self.sizes.current();
        status.size_limit = self.effective_limit();
        status.size_evicting = self.sizes.evicting();
        status.size_writing = self.sizes.writing.load(Ordering::Acquire);
        status.size_leaf = self.sizes.leaf.load(Ordering::Relaxed);
        status.size_nonleaf = self.sizes.nonleaf.load(Ordering::Relaxed);
        status.size_rollback = self.sizes.rollback.load(Ordering::Relaxed);
        status.size_cache_pressure = self.sizes.cache_pressure.load(Ordering::Relaxed);
        let index = self.index.read();
        status.pairs = index.len() as u64;
        status.pinned = index.count_pinned(None) as u64;
        status
    }

    fn verify(&self) -> Result<()> {
        let index = self.index.read();
        index.verify()?;
        let mut total = 0i64;
        for pair in index.pairs() {
            let meta = pair.meta();
            if meta.removed {
                return Err(CacheError::InvalidOwned(format!(
                    "removed pair {} still indexed",
                    meta.key
                )));
            }
            if meta.state != PairState::Reading {
                total += meta.attr.size;
            }
        }
        let accounted = self.sizes.current();
        if total != accounted {
            return Err(CacheError::InvalidOwned(format!(
                "pairs hold {total} bytes but accounting says {accounted}"
            )));
        }
        Ok(())
    }

    pub(crate) fn stop_background(&self) {
        self.evictor.stop();
        self.cleaner.stop();
        self.checkpointer.stop();
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("cachetable.background.join_failed");
            }
        }
        self.client_pool.shutdown();
        self.pool.shutdown();
    }
}

impl<P: Payload> Drop for Shared<P> {
    fn drop(&mut self) {
        self.stop_background();
    }
}
