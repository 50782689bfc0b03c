//! Fuzzy two-phase checkpoint.
//!
//! `begin_checkpoint` marks every dirty (or exclusively pinned) pair as owed
//! to the checkpoint while holding the gate in write mode, so no pin can
//! slip a mutation between the marking of two pairs. Clients that later pin
//! an owed pair exclusively pay the debt first: either by handing a clone of
//! the payload to a worker or by writing the payload in place. Whatever is
//! still owed when `end_checkpoint` runs is written there.

use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};

use super::attr::PairAttr;
use super::file::FileShared;
use super::guard::WriteGuard;
use super::ops::{CheckpointHooks, FlushRequest, NoCheckpointHooks, Payload};
use super::pair::{Pair, PairState};
use super::status::StatCounters;
use super::table::Shared;

pub(crate) struct CheckpointState<P: Payload> {
    pub in_progress: bool,
    pub id: u64,
    pending: Vec<Arc<Pair<P>>>,
    files: Vec<Arc<FileShared<P>>>,
}

impl<P: Payload> Default for CheckpointState<P> {
    fn default() -> Self {
        Self {
            in_progress: false,
            id: 0,
            pending: Vec::new(),
            files: Vec::new(),
        }
    }
}

/// What a pinning client must do about a pair's checkpoint obligation.
pub(crate) enum CheckpointAction<P: Payload> {
    /// Nothing is owed.
    Done,
    /// A clone was taken; write it off the critical path.
    Clone(CloneWrite<P>),
    /// The payload must be written before it may change.
    InPlace,
    /// A clone of this pair is still being written.
    Busy,
}

/// Snapshot of a pair's payload awaiting its checkpoint write.
pub(crate) struct CloneWrite<P: Payload> {
    pair: Arc<Pair<P>>,
    clone: P,
    attr: PairAttr,
}

impl<P: Payload> CloneWrite<P> {
    pub(crate) fn run(self, shared: &Shared<P>) {
        let CloneWrite {
            pair,
            mut clone,
            attr,
        } = self;
        let key = pair.key();
        let result = pair.ops.flush(
            &*pair.file.io,
            key.page_id,
            &mut clone,
            attr,
            FlushRequest::checkpoint_clone(),
        );
        drop(clone);
        shared.sizes.writing.fetch_sub(attr.size, Ordering::AcqRel);
        {
            let mut meta = pair.meta();
            meta.clone_in_flight = false;
            if meta.state == PairState::ClonedWriting {
                meta.state = PairState::Available;
            }
        }
        pair.io_done.notify_all();
        match result {
            Ok(_) => {
                StatCounters::bump(&shared.stats.checkpoint_clones);
                debug!(key = %key, size = attr.size, "cachetable.checkpoint.clone_written");
            }
            Err(err) => shared
                .panic
                .set(format!("checkpoint write of cloned page {key} failed: {err}")),
        }
        shared.signal_flow();
    }
}

impl<P: Payload> Shared<P> {
    /// Marks owed pairs and notifies every open file. Returns the id.
    pub(crate) fn begin_checkpoint(&self) -> Result<u64> {
        self.check_usable()?;
        let id = {
            let mut state = self.checkpoint.lock();
            if state.in_progress {
                return Err(CacheError::Invalid("checkpoint already in progress"));
            }
            state.in_progress = true;
            state.id += 1;
            state.id
        };
        let files = self.files.lock().all();
        let pending = {
            let _gate = self.checkpoint_gate.write();
            let index = self.index.read();
            let mut pending = Vec::new();
            for pair in index.pairs() {
                let mut meta = pair.meta();
                if meta.removed {
                    continue;
                }
                if meta.dirty || meta.writer_pinned {
                    meta.checkpoint_pending = true;
                    pending.push(Arc::clone(pair));
                }
            }
            pending
        };
        for (noted, file) in files.iter().enumerate() {
            let hooks = file.hooks();
            hooks.note_pin_by_checkpoint();
            if let Err(err) = hooks.begin_checkpoint(id) {
                warn!(id, filenum = %file.filenum, error = %err, "cachetable.checkpoint.begin_failed");
                self.abandon_checkpoint(&pending, &files[..=noted]);
                return Err(err);
            }
        }
        info!(id, pending = pending.len(), files = files.len(), "cachetable.checkpoint.begin");
        StatCounters::bump(&self.stats.checkpoints_begun);
        let mut state = self.checkpoint.lock();
        state.pending = pending;
        state.files = files;
        Ok(id)
    }

    /// Undoes a failed begin. `noted` are the files whose pin by the
    /// checkpoint was already recorded.
    fn abandon_checkpoint(&self, pending: &[Arc<Pair<P>>], noted: &[Arc<FileShared<P>>]) {
        for pair in pending {
            pair.meta().checkpoint_pending = false;
        }
        for file in noted {
            file.hooks().note_unpin_by_checkpoint();
        }
        self.checkpoint.lock().in_progress = false;
    }

    /// Writes whatever the running checkpoint is still owed, then lets each
    /// file persist its header.
    pub(crate) fn end_checkpoint(self: &Arc<Self>, hooks: &dyn CheckpointHooks) -> Result<()> {
        let (id, pending, files) = {
            let mut state = self.checkpoint.lock();
            if !state.in_progress {
                return Err(CacheError::Invalid("no checkpoint in progress"));
            }
            (
                state.id,
                mem::take(&mut state.pending),
                mem::take(&mut state.files),
            )
        };
        let mut outcome = Ok(());
        for pair in pending {
            {
                let meta = pair.meta();
                if meta.removed || !meta.checkpoint_pending {
                    continue;
                }
            }
            let mut guard = match pair.value.try_write_arc() {
                Some(guard) => guard,
                None => {
                    hooks.yield_locks();
                    let guard = pair.value.write_arc();
                    hooks.reacquire_locks();
                    guard
                }
            };
            if pair.meta().removed {
                continue;
            }
            match self.prepare_checkpoint_write(&pair, &mut guard, true) {
                Ok(CheckpointAction::Done) | Ok(CheckpointAction::Busy) => {}
                Ok(CheckpointAction::Clone(write)) => {
                    drop(guard);
                    write.run(self);
                }
                Ok(CheckpointAction::InPlace) => {
                    if let Err(err) = self.write_in_place_for_checkpoint(&pair, &mut guard) {
                        outcome = Err(err);
                        break;
                    }
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        self.clone_jobs.wait_idle();
        if outcome.is_ok() {
            outcome = self.panic.check();
        }
        for file in &files {
            let file_hooks = file.hooks();
            if outcome.is_ok() {
                outcome = file_hooks
                    .checkpoint(id)
                    .and_then(|()| file_hooks.end_checkpoint(id));
            }
            file_hooks.note_unpin_by_checkpoint();
        }
        self.checkpoint.lock().in_progress = false;
        match &outcome {
            Ok(()) => {
                StatCounters::bump(&self.stats.checkpoints_completed);
                info!(id, "cachetable.checkpoint.end");
            }
            Err(err) => warn!(id, error = %err, "cachetable.checkpoint.failed"),
        }
        outcome
    }

    pub(crate) fn checkpoint(self: &Arc<Self>) -> Result<u64> {
        let id = self.begin_checkpoint()?;
        self.end_checkpoint(&NoCheckpointHooks)?;
        Ok(id)
    }

    pub(crate) fn checkpoint_in_progress(&self) -> bool {
        self.checkpoint.lock().in_progress
    }

    /// Resolves the pair's checkpoint obligation as far as possible without
    /// writing. The caller holds the value lock exclusively.
    pub(crate) fn prepare_checkpoint_write(
        &self,
        pair: &Arc<Pair<P>>,
        guard: &mut WriteGuard<P>,
        wait: bool,
    ) -> Result<CheckpointAction<P>> {
        let mut meta = pair.meta();
        if !meta.checkpoint_pending {
            return Ok(CheckpointAction::Done);
        }
        if meta.clone_in_flight {
            if !wait {
                return Ok(CheckpointAction::Busy);
            }
            pair.wait_for_clone(&mut meta);
            if !meta.checkpoint_pending {
                return Ok(CheckpointAction::Done);
            }
        }
        if !meta.dirty {
            meta.checkpoint_pending = false;
            return Ok(CheckpointAction::Done);
        }
        let Some(payload) = (**guard).as_ref() else {
            return Err(CacheError::Invalid("checkpoint of a pair without payload"));
        };
        match pair.ops.clone_for_checkpoint(payload) {
            Some((clone, attr)) => {
                meta.checkpoint_pending = false;
                meta.dirty = false;
                meta.clone_in_flight = true;
                if meta.state == PairState::Available {
                    meta.state = PairState::ClonedWriting;
                }
                drop(meta);
                self.sizes.writing.fetch_add(attr.size, Ordering::AcqRel);
                Ok(CheckpointAction::Clone(CloneWrite {
                    pair: Arc::clone(pair),
                    clone,
                    attr,
                }))
            }
            None => Ok(CheckpointAction::InPlace),
        }
    }

    /// Writes the payload for the checkpoint under the caller's exclusive
    /// value lock. Failure is fatal to the table.
    pub(crate) fn write_in_place_for_checkpoint(
        &self,
        pair: &Arc<Pair<P>>,
        guard: &mut WriteGuard<P>,
    ) -> Result<()> {
        let Some(payload) = (**guard).as_mut() else {
            return Err(CacheError::Invalid("checkpoint of a pair without payload"));
        };
        let (key, attr, prior) = {
            let mut meta = pair.meta();
            let prior = mem::replace(&mut meta.state, PairState::Writing);
            (meta.key, meta.attr, prior)
        };
        self.sizes.writing.fetch_add(attr.size, Ordering::AcqRel);
        let result = pair.ops.flush(
            &*pair.file.io,
            key.page_id,
            payload,
            attr,
            FlushRequest::checkpoint_in_place(),
        );
        self.sizes.writing.fetch_sub(attr.size, Ordering::AcqRel);
        let mut meta = pair.meta();
        meta.state = prior;
        match result {
            Ok(new_attr) => {
                self.sizes.replace(&attr, &new_attr);
                meta.attr = new_attr;
                meta.dirty = false;
                meta.checkpoint_pending = false;
                drop(meta);
                StatCounters::bump(&self.stats.checkpoint_writes);
                debug!(key = %key, size = new_attr.size, "cachetable.checkpoint.written");
                Ok(())
            }
            Err(err) => {
                drop(meta);
                self.panic
                    .set(format!("checkpoint write of page {key} failed: {err}"));
                Err(err)
            }
        }
    }

    /// Pays a pending checkpoint obligation before an exclusive holder may
    /// mutate the payload. Called with the gate held in read mode.
    pub(crate) fn settle_checkpoint_before_mutation(
        self: &Arc<Self>,
        pair: &Arc<Pair<P>>,
        guard: &mut WriteGuard<P>,
    ) -> Result<()> {
        match self.prepare_checkpoint_write(pair, guard, true)? {
            CheckpointAction::Done | CheckpointAction::Busy => Ok(()),
            CheckpointAction::Clone(write) => {
                self.submit_clone_write(write);
                Ok(())
            }
            CheckpointAction::InPlace => self.write_in_place_for_checkpoint(pair, guard),
        }
    }

    /// Hands a clone write to the worker pool; writes inline once the file or
    /// the table stops taking background work.
    pub(crate) fn submit_clone_write(self: &Arc<Self>, write: CloneWrite<P>) {
        let tickets = self
            .clone_jobs
            .add()
            .and_then(|table_ticket| write.pair.file.jobs.add().map(|file_ticket| (table_ticket, file_ticket)));
        match tickets {
            Ok(tickets) => {
                let shared = Arc::clone(self);
                self.pool.submit_or_run(Box::new(move || {
                    let _tickets = tickets;
                    write.run(&shared);
                }));
            }
            Err(_) => write.run(self),
        }
    }

    pub(crate) fn checkpointer_pass(shared: &Arc<Self>) {
        if shared.checkpoint_in_progress() || shared.panic.check().is_err() {
            return;
        }
        if let Err(err) = shared.checkpoint() {
            warn!(error = %err, "cachetable.checkpointer.failed");
        }
    }
}
