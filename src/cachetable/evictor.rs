//! CLOCK eviction.
//!
//! The hand sweeps the clock ring. A pair with a positive counter is aged by
//! one and offered a partial eviction; a pair at zero is written if dirty
//! and dropped. Pinned or mid-I/O pairs are skipped.

use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CacheError, Result};

use super::guard::WriteGuard;
use super::ops::{FlushRequest, PartialEvictionCost, Payload};
use super::pair::{Pair, PairState, CLOCK_SATURATION};
use super::status::StatCounters;
use super::table::Shared;

/// Outcome of one visit of the clock hand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Visit {
    Busy,
    Aged,
    Partial(i64),
    Scheduled(i64),
    Evicted(i64),
    Failed,
}

impl<P: Payload> Shared<P> {
    /// Sweeps until resident bytes (minus bytes already being freed) drop to
    /// `target`, or until a full sweep makes no progress. Returns bytes freed
    /// synchronously.
    pub(crate) fn evict_until(self: &Arc<Self>, target: i64) -> i64 {
        let mut freed = 0i64;
        let mut busy_streak = 0usize;
        let mut idle = 0usize;
        loop {
            if self.sizes.current() - self.sizes.evicting() <= target {
                break;
            }
            let (pair, ring) = {
                let mut index = self.index.write();
                let ring = index.len();
                (index.advance_evictor(), ring)
            };
            let Some(pair) = pair else {
                break;
            };
            match self.visit(&pair) {
                Visit::Busy | Visit::Failed => {
                    busy_streak += 1;
                    idle += 1;
                }
                Visit::Aged | Visit::Partial(0) | Visit::Scheduled(_) => {
                    busy_streak = 0;
                    idle += 1;
                }
                Visit::Partial(bytes) | Visit::Evicted(bytes) => {
                    freed += bytes;
                    busy_streak = 0;
                    idle = 0;
                }
            }
            if busy_streak >= ring || idle >= ring * (CLOCK_SATURATION as usize + 2) {
                break;
            }
        }
        if freed > 0 {
            self.signal_flow();
        }
        freed
    }

    fn visit(self: &Arc<Self>, pair: &Arc<Pair<P>>) -> Visit {
        let Some(guard) = pair.value.try_write_arc() else {
            return Visit::Busy;
        };
        let count = {
            let mut meta = pair.meta();
            if meta.is_busy() {
                return Visit::Busy;
            }
            let count = meta.clock_count;
            meta.clock_count = count.saturating_sub(1);
            count
        };
        if count > 0 {
            return self.try_partial_eviction(pair, guard);
        }
        match self.evict_pair(pair, guard) {
            Ok(bytes) => Visit::Evicted(bytes),
            Err(_) => Visit::Failed,
        }
    }

    fn try_partial_eviction(self: &Arc<Self>, pair: &Arc<Pair<P>>, mut guard: WriteGuard<P>) -> Visit {
        let Some(payload) = (*guard).as_ref() else {
            return Visit::Aged;
        };
        let (bytes, cost) = pair.ops.partial_eviction_estimate(payload);
        if bytes == 0 {
            return Visit::Aged;
        }
        match cost {
            PartialEvictionCost::Cheap => match self.partial_evict_locked(pair, &mut guard, bytes) {
                Ok(freed) => Visit::Partial(freed),
                Err(_) => Visit::Failed,
            },
            PartialEvictionCost::Expensive => {
                let Ok(ticket) = pair.file.jobs.add() else {
                    return Visit::Aged;
                };
                let estimate = bytes as i64;
                pair.meta().state = PairState::PartialEvictionInProgress;
                self.sizes.evicting.fetch_add(estimate, Ordering::AcqRel);
                drop(guard);
                let shared = Arc::clone(self);
                let pair = Arc::clone(pair);
                self.pool.submit_or_run(Box::new(move || {
                    let _ticket = ticket;
                    match pair.value.try_write_arc() {
                        Some(mut guard) => {
                            if !pair.meta().removed {
                                let _ = shared.partial_evict_locked(&pair, &mut guard, bytes);
                            }
                        }
                        None => {
                            // Pinned again since it was chosen; leave it whole.
                            let mut meta = pair.meta();
                            if meta.state == PairState::PartialEvictionInProgress {
                                meta.state = PairState::Available;
                            }
                        }
                    }
                    shared.sizes.evicting.fetch_sub(estimate, Ordering::AcqRel);
                    shared.signal_flow();
                }));
                Visit::Scheduled(estimate)
            }
        }
    }

    /// Shrinks the payload under the caller's exclusive lock. Returns bytes
    /// freed.
    fn partial_evict_locked(&self, pair: &Arc<Pair<P>>, guard: &mut WriteGuard<P>, bytes: u64) -> Result<i64> {
        let Some(payload) = (**guard).as_mut() else {
            return Err(CacheError::Invalid("partial eviction of a pair without payload"));
        };
        let (key, old_attr, prior) = {
            let mut meta = pair.meta();
            let prior = match mem::replace(&mut meta.state, PairState::PartialEvictionInProgress) {
                PairState::PartialEvictionInProgress => PairState::Available,
                state => state,
            };
            (meta.key, meta.attr, prior)
        };
        let result = pair.ops.partial_eviction(payload, old_attr, bytes);
        let partial = pair.ops.partial_fetch_required(payload);
        let mut meta = pair.meta();
        match result {
            Ok(new_attr) => {
                self.sizes.replace(&old_attr, &new_attr);
                meta.attr = new_attr;
                meta.state = if partial {
                    PairState::Partial
                } else {
                    PairState::Available
                };
                drop(meta);
                let freed = old_attr.size - new_attr.size;
                StatCounters::bump(&self.stats.partial_evictions);
                StatCounters::add(&self.stats.partial_eviction_bytes, freed.max(0) as u64);
                debug!(key = %key, freed, "cachetable.evictor.partial");
                if freed > 0 {
                    self.signal_flow();
                }
                Ok(freed)
            }
            Err(err) => {
                meta.state = prior;
                drop(meta);
                warn!(key = %key, error = %err, "cachetable.evictor.partial_failed");
                Err(err)
            }
        }
    }

    /// Writes the pair if dirty and removes it. On a write failure the pair
    /// stays resident and dirty; a failure owed to a checkpoint is fatal.
    pub(crate) fn evict_pair(&self, pair: &Arc<Pair<P>>, mut guard: WriteGuard<P>) -> Result<i64> {
        let (key, attr, dirty, for_checkpoint, prior) = {
            let mut meta = pair.meta();
            let dirty = mem::take(&mut meta.dirty);
            let for_checkpoint = mem::take(&mut meta.checkpoint_pending);
            let prior = if dirty {
                mem::replace(&mut meta.state, PairState::Writing)
            } else {
                meta.state
            };
            (meta.key, meta.attr, dirty, for_checkpoint, prior)
        };
        if dirty {
            self.sizes.writing.fetch_add(attr.size, Ordering::AcqRel);
        }
        let result = match (*guard).as_mut() {
            Some(payload) => pair.ops.flush(
                &*pair.file.io,
                key.page_id,
                payload,
                attr,
                FlushRequest::evict(dirty, for_checkpoint),
            ),
            None => Ok(attr),
        };
        if dirty {
            self.sizes.writing.fetch_sub(attr.size, Ordering::AcqRel);
        }
        if let Err(err) = result {
            {
                let mut meta = pair.meta();
                meta.dirty = dirty;
                meta.checkpoint_pending = for_checkpoint;
                meta.state = prior;
            }
            StatCounters::bump(&self.stats.eviction_write_errors);
            warn!(key = %key, error = %err, for_checkpoint, "cachetable.evictor.write_failed");
            if for_checkpoint {
                self.panic
                    .set(format!("checkpoint write of evicted page {key} failed: {err}"));
            }
            return Err(err);
        }
        self.index.write().remove(key, pair);
        {
            let mut meta = pair.meta();
            meta.removed = true;
            meta.state = PairState::OnDisk;
        }
        self.sizes.sub(&attr);
        *guard = None;
        drop(guard);
        pair.io_done.notify_all();
        if dirty {
            StatCounters::bump(&self.stats.evictions_dirty);
        } else {
            StatCounters::bump(&self.stats.evictions_clean);
        }
        debug!(key = %key, size = attr.size, dirty, "cachetable.evictor.evicted");
        Ok(attr.size)
    }

    pub(crate) fn evictor_pass(shared: &Arc<Self>) {
        let limit = shared.effective_limit();
        if shared.sizes.current() > limit {
            let freed = shared.evict_until(limit);
            debug!(freed, limit, "cachetable.evictor.pass");
        }
    }
}
