#![forbid(unsafe_code)]

//! Identifiers shared by every cachetable component.

use std::fmt;
use std::hash::Hasher;

use xxhash_rust::xxh64::Xxh64;

/// Process-unique number of an open cachefile.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileNum(pub u32);

/// Owner-assigned block number of a page within its file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Identity hash of a page, recomputable from `(file, page)`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FullHash(pub u32);

/// Key of a pair in the page index.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PairKey {
    /// File the page belongs to.
    pub filenum: FileNum,
    /// Page number inside the file.
    pub page_id: PageId,
}

impl PairKey {
    /// Builds a key from its parts.
    pub fn new(filenum: FileNum, page_id: PageId) -> Self {
        Self { filenum, page_id }
    }

    /// Full hash of this key.
    pub fn fullhash(&self) -> FullHash {
        fullhash(self.filenum, self.page_id)
    }
}

/// Computes the full hash for a page of `filenum`.
pub fn fullhash(filenum: FileNum, page_id: PageId) -> FullHash {
    let mut hasher = Xxh64::new(0);
    hasher.write_u32(filenum.0);
    hasher.write_u64(page_id.0);
    let wide = hasher.finish();
    FullHash((wide ^ (wide >> 32)) as u32)
}

impl fmt::Display for FileNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filenum, self.page_id)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

impl From<PageId> for u64 {
    fn from(value: PageId) -> Self {
        value.0
    }
}
