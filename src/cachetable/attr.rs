use std::sync::atomic::{AtomicI64, Ordering};

/// Owner-reported size and shape of a page, used for memory accounting.
///
/// Only `size` gates admission; the category fields are tracked for
/// observability.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PairAttr {
    /// Total resident bytes.
    pub size: i64,
    /// Bytes attributed to interior nodes.
    pub nonleaf_size: i64,
    /// Bytes attributed to leaf nodes.
    pub leaf_size: i64,
    /// Bytes attributed to rollback log nodes.
    pub rollback_size: i64,
    /// Work the cleaner could do on this page; higher is more urgent.
    pub cache_pressure_size: i64,
    /// False when the owner has not computed the attribute yet.
    pub is_valid: bool,
}

impl PairAttr {
    /// Attribute with only a total size.
    pub fn with_size(size: i64) -> Self {
        Self {
            size,
            is_valid: true,
            ..Self::default()
        }
    }

    /// Attribute for a leaf page of `size` bytes.
    pub fn leaf(size: i64) -> Self {
        Self {
            size,
            leaf_size: size,
            is_valid: true,
            ..Self::default()
        }
    }

    /// Attribute for an interior page of `size` bytes with `pressure` pending
    /// cleaner work.
    pub fn nonleaf(size: i64, pressure: i64) -> Self {
        Self {
            size,
            nonleaf_size: size,
            cache_pressure_size: pressure,
            is_valid: true,
            ..Self::default()
        }
    }
}

/// Table-wide byte counters, one per accounting category.
#[derive(Default)]
pub(crate) struct SizeCounters {
    pub current: AtomicI64,
    pub evicting: AtomicI64,
    pub writing: AtomicI64,
    pub leaf: AtomicI64,
    pub nonleaf: AtomicI64,
    pub rollback: AtomicI64,
    pub cache_pressure: AtomicI64,
}

impl SizeCounters {
    pub fn add(&self, attr: &PairAttr) {
        self.apply(attr, 1);
    }

    pub fn sub(&self, attr: &PairAttr) {
        self.apply(attr, -1);
    }

    pub fn replace(&self, old: &PairAttr, new: &PairAttr) {
        if old != new {
            self.sub(old);
            self.add(new);
        }
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn evicting(&self) -> i64 {
        self.evicting.load(Ordering::Acquire)
    }

    fn apply(&self, attr: &PairAttr, sign: i64) {
        self.current.fetch_add(sign * attr.size, Ordering::AcqRel);
        self.leaf.fetch_add(sign * attr.leaf_size, Ordering::Relaxed);
        self.nonleaf.fetch_add(sign * attr.nonleaf_size, Ordering::Relaxed);
        self.rollback.fetch_add(sign * attr.rollback_size, Ordering::Relaxed);
        self.cache_pressure
            .fetch_add(sign * attr.cache_pressure_size, Ordering::Relaxed);
    }
}
