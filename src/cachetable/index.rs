use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{CacheError, Result};
use crate::types::{FileNum, FullHash, PairKey};

use super::ops::Payload;
use super::pair::Pair;

/// Pairs the cleaner inspects per selection.
pub(crate) const CLEANER_SCAN_WIDTH: usize = 8;

/// Key-to-pair map plus the circular order the clock hands walk.
///
/// Each pair records its slot in `clock`; removal swaps the last pair into
/// the hole and fixes its slot.
pub(crate) struct PageIndex<P: Payload> {
    map: FxHashMap<PairKey, Arc<Pair<P>>>,
    clock: Vec<Arc<Pair<P>>>,
    evictor_hand: usize,
    cleaner_hand: usize,
}

impl<P: Payload> Default for PageIndex<P> {
    fn default() -> Self {
        Self {
            map: FxHashMap::default(),
            clock: Vec::new(),
            evictor_hand: 0,
            cleaner_hand: 0,
        }
    }
}

impl<P: Payload> PageIndex<P> {
    /// Returns the pair for `key` when its stored hash matches `fullhash`.
    pub fn find(&self, key: PairKey, fullhash: FullHash) -> Option<Arc<Pair<P>>> {
        let pair = self.map.get(&key)?;
        if pair.meta().fullhash != fullhash {
            tracing::debug!(key = %key, "cachetable.index.fullhash_mismatch");
            return None;
        }
        Some(Arc::clone(pair))
    }

    pub fn get(&self, key: PairKey) -> Option<Arc<Pair<P>>> {
        self.map.get(&key).cloned()
    }

    pub fn insert(&mut self, key: PairKey, pair: Arc<Pair<P>>) -> Result<()> {
        if self.map.contains_key(&key) {
            return Err(CacheError::AlreadyExists);
        }
        pair.set_clock_slot(self.clock.len());
        self.clock.push(Arc::clone(&pair));
        self.map.insert(key, pair);
        Ok(())
    }

    /// Removes `pair` if it is the one registered under `key`.
    pub fn remove(&mut self, key: PairKey, pair: &Arc<Pair<P>>) -> bool {
        match self.map.get(&key) {
            Some(existing) if Arc::ptr_eq(existing, pair) => {}
            _ => return false,
        }
        self.map.remove(&key);
        let slot = pair.clock_slot();
        if slot < self.clock.len() && Arc::ptr_eq(&self.clock[slot], pair) {
            self.clock.swap_remove(slot);
            if let Some(moved) = self.clock.get(slot) {
                moved.set_clock_slot(slot);
            }
        }
        pair.set_clock_slot(usize::MAX);
        true
    }

    /// Moves `pair` from `old` to `new`.
    pub fn rekey(&mut self, old: PairKey, new: PairKey, pair: &Arc<Pair<P>>) -> Result<()> {
        if self.map.contains_key(&new) {
            return Err(CacheError::AlreadyExists);
        }
        match self.map.remove(&old) {
            Some(existing) if Arc::ptr_eq(&existing, pair) => {
                self.map.insert(new, existing);
                Ok(())
            }
            Some(other) => {
                self.map.insert(old, other);
                Err(CacheError::NotFound)
            }
            None => Err(CacheError::NotFound),
        }
    }

    pub fn len(&self) -> usize {
        self.clock.len()
    }

    /// Next pair under the evictor hand.
    pub fn advance_evictor(&mut self) -> Option<Arc<Pair<P>>> {
        if self.clock.is_empty() {
            return None;
        }
        if self.evictor_hand >= self.clock.len() {
            self.evictor_hand = 0;
        }
        let pair = Arc::clone(&self.clock[self.evictor_hand]);
        self.evictor_hand += 1;
        Some(pair)
    }

    /// Up to [`CLEANER_SCAN_WIDTH`] pairs starting at the cleaner hand.
    pub fn advance_cleaner(&mut self) -> SmallVec<[Arc<Pair<P>>; CLEANER_SCAN_WIDTH]> {
        let mut out = SmallVec::new();
        let len = self.clock.len();
        if len == 0 {
            return out;
        }
        for _ in 0..CLEANER_SCAN_WIDTH.min(len) {
            if self.cleaner_hand >= len {
                self.cleaner_hand = 0;
            }
            out.push(Arc::clone(&self.clock[self.cleaner_hand]));
            self.cleaner_hand += 1;
        }
        out
    }

    pub fn pairs(&self) -> impl Iterator<Item = &Arc<Pair<P>>> {
        self.clock.iter()
    }

    pub fn pairs_of(&self, filenum: FileNum) -> Vec<Arc<Pair<P>>> {
        self.clock
            .iter()
            .filter(|pair| pair.file.filenum == filenum)
            .cloned()
            .collect()
    }

    pub fn count_pinned(&self, filenum: Option<FileNum>) -> usize {
        self.clock
            .iter()
            .filter(|pair| filenum.map_or(true, |f| pair.file.filenum == f))
            .filter(|pair| pair.meta().pins > 0)
            .count()
    }

    /// Checks map and clock cross-links.
    pub fn verify(&self) -> Result<()> {
        if self.map.len() != self.clock.len() {
            return Err(CacheError::InvalidOwned(format!(
                "index holds {} keys but clock holds {} pairs",
                self.map.len(),
                self.clock.len()
            )));
        }
        for (slot, pair) in self.clock.iter().enumerate() {
            if pair.clock_slot() != slot {
                return Err(CacheError::InvalidOwned(format!(
                    "pair at clock slot {slot} records slot {}",
                    pair.clock_slot()
                )));
            }
            let key = pair.key();
            match self.map.get(&key) {
                Some(mapped) if Arc::ptr_eq(mapped, pair) => {}
                _ => {
                    return Err(CacheError::InvalidOwned(format!(
                        "pair {key} is on the clock but not in the map"
                    )))
                }
            }
        }
        Ok(())
    }
}
