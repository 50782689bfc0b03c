//! Concurrent page cache for fractal-tree style storage.
//!
//! A [`CacheTable`] holds pages ("pairs") of many cachefiles under a shared
//! memory budget. Callers pin pages shared or exclusive through a
//! [`PinGuard`], the evictor sweeps a CLOCK ring to keep resident bytes near
//! the limit, the cleaner hands high-pressure pages back to their owners,
//! and a fuzzy checkpoint writes every page that was dirty when it began.
//!
//! Page contents are opaque: owners describe how to load, write, clone and
//! shrink them through [`PageOps`].

mod attr;
mod checkpoint;
mod cleaner;
mod evictor;
mod file;
mod guard;
mod index;
mod ops;
mod options;
mod pair;
mod periodic;
mod status;
mod table;

/// Page size accounting.
pub use attr::PairAttr;

/// Cachefile handles and per-file hooks.
pub use file::{CacheFile, FileHooks, NoFileHooks};

/// Pinning.
pub use guard::{DependentPair, PinGuard, PinMode};

/// Owner callbacks.
pub use ops::{
    CheckpointHooks, Fetched, FlushRequest, NoCheckpointHooks, PageOps, PartialEvictionCost,
    Payload,
};

/// Configuration.
pub use options::{CacheTableOptions, Watermarks};

/// Introspection.
pub use pair::{PairState, PairStateInfo};
pub use status::CacheTableStatus;

/// The cache itself.
pub use table::CacheTable;
