//! Cachetable: a concurrent page cache with CLOCK eviction, partial
//! eviction, background workers and fuzzy checkpoints.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cachetable::{CacheTable, CacheTableOptions, PinMode};
//! # use cachetable::{Fetched, FlushRequest, PageOps, PairAttr, Result};
//! # use cachetable::primitives::io::FileIo;
//! # use cachetable::types::{FullHash, PageId};
//! # struct Ops;
//! # impl PageOps<u64> for Ops {
//! #     fn fetch(&self, _: &dyn FileIo, p: PageId, _: FullHash) -> Result<Fetched<u64>> {
//! #         Ok(Fetched::clean(p.0, PairAttr::with_size(8)))
//! #     }
//! #     fn flush(&self, _: &dyn FileIo, _: PageId, _: &mut u64, a: PairAttr, _: FlushRequest) -> Result<PairAttr> {
//! #         Ok(a)
//! #     }
//! # }
//! # fn main() -> Result<()> {
//! let table = CacheTable::<u64>::new(CacheTableOptions::default())?;
//! let file = table.open_path("pages.db", Arc::new(Ops))?;
//! let page = PageId(7);
//! let hash = cachetable::types::PairKey::new(file.filenum(), page).fullhash();
//! let guard = table.get_and_pin(&file, page, hash, PinMode::Shared)?;
//! assert_eq!(*guard, 7);
//! drop(guard);
//! table.close_file(&file)?;
//! table.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cachetable;
pub mod error;
pub mod primitives;
pub mod types;

pub use crate::cachetable::{
    CacheFile, CacheTable, CacheTableOptions, CacheTableStatus, CheckpointHooks, DependentPair,
    Fetched, FileHooks, FlushRequest, NoCheckpointHooks, NoFileHooks, PageOps, PairAttr,
    PairState, PairStateInfo, PartialEvictionCost, Payload, PinGuard, PinMode, Watermarks,
};
pub use crate::error::{CacheError, Result};
