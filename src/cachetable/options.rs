use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Configuration for a [`CacheTable`](super::CacheTable).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTableOptions {
    /// Ceiling on resident bytes as reported by page attributes.
    pub size_limit: u64,
    /// Threads in the background worker pool.
    pub worker_threads: usize,
    /// Threads running owner jobs queued with `enqueue_job`.
    pub client_threads: usize,
    /// Period of the evictor thread in milliseconds.
    pub evictor_period_ms: u64,
    /// Period of the cleaner thread in milliseconds; 0 disables it.
    pub cleaner_period_ms: u64,
    /// Pages the cleaner works on per wakeup.
    pub cleaner_iterations: u32,
    /// Period of the checkpointer thread in milliseconds; `None` disables it.
    pub checkpoint_period_ms: Option<u64>,
    /// Longest a new page waits for room once eviction stalls before it is
    /// admitted over the limit; `None` waits until an unpin or eviction
    /// makes room.
    pub admission_wait_ms: Option<u64>,
}

impl Default for CacheTableOptions {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(1, 8);
        Self {
            size_limit: 128 << 20,
            worker_threads: workers,
            client_threads: workers,
            evictor_period_ms: 1000,
            cleaner_period_ms: 1000,
            cleaner_iterations: 1,
            checkpoint_period_ms: None,
            admission_wait_ms: None,
        }
    }
}

impl CacheTableOptions {
    /// Parses options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let parsed: Self = toml::from_str(text)
            .map_err(|err| CacheError::InvalidOwned(format!("cachetable options: {err}")))?;
        Ok(parsed.normalize())
    }

    /// Reads options from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(CacheError::from)?;
        Self::from_toml_str(&text)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|err| CacheError::InvalidOwned(format!("cachetable options: {err}")))
    }

    pub(crate) fn normalize(mut self) -> Self {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        if self.client_threads == 0 {
            self.client_threads = 1;
        }
        if self.evictor_period_ms == 0 {
            self.evictor_period_ms = 1;
        }
        if self.cleaner_iterations == 0 {
            self.cleaner_iterations = 1;
        }
        if self.checkpoint_period_ms == Some(0) {
            self.checkpoint_period_ms = None;
        }
        self
    }

    pub(crate) fn evictor_period(&self) -> Duration {
        Duration::from_millis(self.evictor_period_ms)
    }

    pub(crate) fn cleaner_period(&self) -> Option<Duration> {
        (self.cleaner_period_ms > 0).then(|| Duration::from_millis(self.cleaner_period_ms))
    }

    pub(crate) fn checkpoint_period(&self) -> Option<Duration> {
        self.checkpoint_period_ms.map(Duration::from_millis)
    }

    pub(crate) fn admission_wait(&self) -> Option<Duration> {
        self.admission_wait_ms.map(Duration::from_millis)
    }
}

/// Eviction thresholds derived from the effective size limit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Watermarks {
    /// The evictor works down to this level.
    pub low: i64,
    /// Above this, clients wake the evictor.
    pub low_hysteresis: i64,
    /// Above this, fetching clients help evict.
    pub high_hysteresis: i64,
    /// Hard level at which clients evict before continuing.
    pub high: i64,
}

impl Watermarks {
    /// Ladder for `limit` bytes.
    pub fn for_limit(limit: i64) -> Self {
        Self {
            low: limit,
            low_hysteresis: limit + limit / 10,
            high_hysteresis: limit + limit / 4,
            high: limit + limit / 2,
        }
    }
}
