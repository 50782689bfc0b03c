use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of cache table counters and sizes.
#[derive(Default, Clone, Debug)]
pub struct CacheTableStatus {
    /// Pins satisfied by a resident page.
    pub hits: u64,
    /// Pins that had to fetch.
    pub misses: u64,
    /// Time spent fetching on misses, in microseconds.
    pub miss_time_us: u64,
    /// New pages inserted with `put`.
    pub puts: u64,
    /// Background fetches started by prefetch or nonblocking pins.
    pub prefetches: u64,
    /// Clean pages evicted.
    pub evictions_clean: u64,
    /// Dirty pages written and evicted.
    pub evictions_dirty: u64,
    /// Eviction writes that failed; the page stayed resident.
    pub eviction_write_errors: u64,
    /// Partial evictions that freed memory.
    pub partial_evictions: u64,
    /// Bytes freed by partial evictions.
    pub partial_eviction_bytes: u64,
    /// Partial fetches performed.
    pub partial_fetches: u64,
    /// Cleaner callbacks executed.
    pub cleaner_executions: u64,
    /// Checkpoints begun.
    pub checkpoints_begun: u64,
    /// Checkpoints completed.
    pub checkpoints_completed: u64,
    /// Checkpoint writes done from a clone.
    pub checkpoint_clones: u64,
    /// Checkpoint writes of any kind.
    pub checkpoint_writes: u64,
    /// Admissions that had to wait for an unpin.
    pub admission_waits: u64,
    /// Time spent waiting for admission, in microseconds.
    pub admission_wait_us: u64,
    /// Resident bytes.
    pub size_current: i64,
    /// Effective limit after reservations.
    pub size_limit: i64,
    /// Bytes being freed by background partial evictions.
    pub size_evicting: i64,
    /// Bytes held by clones being written.
    pub size_writing: i64,
    /// Leaf bytes.
    pub size_leaf: i64,
    /// Interior bytes.
    pub size_nonleaf: i64,
    /// Rollback bytes.
    pub size_rollback: i64,
    /// Outstanding cleaner work.
    pub size_cache_pressure: i64,
    /// Resident pairs.
    pub pairs: u64,
    /// Pinned pairs.
    pub pinned: u64,
}

impl fmt::Display for CacheTableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pairs={} pinned={} size={}/{} hits={} misses={} evictions={}+{} partial={} checkpoints={}/{}",
            self.pairs,
            self.pinned,
            self.size_current,
            self.size_limit,
            self.hits,
            self.misses,
            self.evictions_clean,
            self.evictions_dirty,
            self.partial_evictions,
            self.checkpoints_completed,
            self.checkpoints_begun
        )
    }
}

#[derive(Default)]
pub(crate) struct StatCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub miss_time_us: AtomicU64,
    pub puts: AtomicU64,
    pub prefetches: AtomicU64,
    pub evictions_clean: AtomicU64,
    pub evictions_dirty: AtomicU64,
    pub eviction_write_errors: AtomicU64,
    pub partial_evictions: AtomicU64,
    pub partial_eviction_bytes: AtomicU64,
    pub partial_fetches: AtomicU64,
    pub cleaner_executions: AtomicU64,
    pub checkpoints_begun: AtomicU64,
    pub checkpoints_completed: AtomicU64,
    pub checkpoint_clones: AtomicU64,
    pub checkpoint_writes: AtomicU64,
    pub admission_waits: AtomicU64,
    pub admission_wait_us: AtomicU64,
}

impl StatCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn fill(&self, status: &mut CacheTableStatus) {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        status.hits = load(&self.hits);
        status.misses = load(&self.misses);
        status.miss_time_us = load(&self.miss_time_us);
        status.puts = load(&self.puts);
        status.prefetches = load(&self.prefetches);
        status.evictions_clean = load(&self.evictions_clean);
        status.evictions_dirty = load(&self.evictions_dirty);
        status.eviction_write_errors = load(&self.eviction_write_errors);
        status.partial_evictions = load(&self.partial_evictions);
        status.partial_eviction_bytes = load(&self.partial_eviction_bytes);
        status.partial_fetches = load(&self.partial_fetches);
        status.cleaner_executions = load(&self.cleaner_executions);
        status.checkpoints_begun = load(&self.checkpoints_begun);
        status.checkpoints_completed = load(&self.checkpoints_completed);
        status.checkpoint_clones = load(&self.checkpoint_clones);
        status.checkpoint_writes = load(&self.checkpoint_writes);
        status.admission_waits = load(&self.admission_waits);
        status.admission_wait_us = load(&self.admission_wait_us);
    }
}
